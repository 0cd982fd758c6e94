//! 会话线程身份与 Deal 关联
//!
//! threadKey 由渠道 + 对方身份派生；Deal 关联先按 threadKey 精确匹配，再按同一创作者下的对方身份匹配，
//! 终态 Deal（completed / cancelled / declined）不参与匹配。关联失败不影响后续处理。

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{BrandContext, Sender};
use crate::core::DealError;

/// Deal 在业务侧的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Inquiry,
    Negotiating,
    Active,
    Completed,
    Cancelled,
    Declined,
}

impl DealStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealStatus::Completed | DealStatus::Cancelled | DealStatus::Declined
        )
    }
}

/// Deal 目录中的一条记录（仅关联所需字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealRef {
    pub deal_id: String,
    pub creator_id: String,
    pub thread_key: Option<String>,
    pub counterpart_id: Option<String>,
    pub brand_name: Option<String>,
    pub status: DealStatus,
}

/// Deal 目录：业务侧 Deal 存储的只读视图
#[async_trait]
pub trait DealDirectory: Send + Sync {
    async fn find_by_thread_key(&self, thread_key: &str) -> Result<Vec<DealRef>, DealError>;

    async fn find_by_counterpart(
        &self,
        creator_id: &str,
        counterpart_id: &str,
    ) -> Result<Vec<DealRef>, DealError>;

    async fn get(&self, deal_id: &str) -> Result<Option<DealRef>, DealError>;
}

/// 内存 Deal 目录
#[derive(Default)]
pub struct InMemoryDealDirectory {
    deals: RwLock<Vec<DealRef>>,
}

impl InMemoryDealDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, deal: DealRef) {
        if let Ok(mut deals) = self.deals.write() {
            deals.retain(|d| d.deal_id != deal.deal_id);
            deals.push(deal);
        }
    }

    fn filter(&self, pred: impl Fn(&DealRef) -> bool) -> Result<Vec<DealRef>, DealError> {
        let deals = self
            .deals
            .read()
            .map_err(|_| DealError::DirectoryFailed("deal directory lock poisoned".to_string()))?;
        Ok(deals.iter().filter(|d| pred(d)).cloned().collect())
    }
}

#[async_trait]
impl DealDirectory for InMemoryDealDirectory {
    async fn find_by_thread_key(&self, thread_key: &str) -> Result<Vec<DealRef>, DealError> {
        self.filter(|d| d.thread_key.as_deref() == Some(thread_key))
    }

    async fn find_by_counterpart(
        &self,
        creator_id: &str,
        counterpart_id: &str,
    ) -> Result<Vec<DealRef>, DealError> {
        self.filter(|d| {
            d.creator_id == creator_id && d.counterpart_id.as_deref() == Some(counterpart_id)
        })
    }

    async fn get(&self, deal_id: &str) -> Result<Option<DealRef>, DealError> {
        Ok(self.filter(|d| d.deal_id == deal_id)?.into_iter().next())
    }
}

/// 对方身份：优先渠道 id，其次发件人名
pub fn counterpart_id(sender: Option<&Sender>) -> Option<String> {
    let sender = sender?;
    sender
        .id
        .as_deref()
        .or(sender.name.as_deref())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// 派生 threadKey：上游给出则沿用，否则为 `渠道:对方身份`
pub fn derive_thread_key(
    explicit: Option<&str>,
    source: &str,
    sender: Option<&Sender>,
    inquiry_id: &str,
) -> String {
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return key.to_string();
    }
    let channel = match source.trim() {
        "" => "unknown".to_string(),
        s => s.to_lowercase(),
    };
    let who = counterpart_id(sender).unwrap_or_else(|| inquiry_id.to_string());
    format!("{}:{}", channel, who)
}

/// 尽力关联 Deal；任何失败都只记录日志并返回 None
pub async fn resolve_deal(directory: &dyn DealDirectory, ctx: &BrandContext) -> Option<String> {
    match directory.find_by_thread_key(&ctx.thread_key).await {
        Ok(deals) => {
            if let Some(deal) = deals.into_iter().find(|d| !d.status.is_terminal()) {
                return Some(deal.deal_id);
            }
        }
        Err(e) => {
            tracing::warn!(inquiry_id = %ctx.inquiry_id, "deal lookup by thread key failed: {}", e);
        }
    }

    let counterpart = ctx.counterpart_id.as_deref()?;
    match directory.find_by_counterpart(&ctx.creator_id, counterpart).await {
        Ok(deals) => deals
            .into_iter()
            .find(|d| !d.status.is_terminal())
            .map(|d| d.deal_id),
        Err(e) => {
            tracing::warn!(inquiry_id = %ctx.inquiry_id, "deal lookup by counterpart failed: {}", e);
            None
        }
    }
}
