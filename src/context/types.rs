//! 品牌上下文与入站抽取事件的数据类型
//!
//! 入站事件 `inquiry.extracted` 由外部消息分类/抽取协作方产生，字段均可缺失；
//! BrandContext 是合并后的结果，每个 inquiry 一份。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单项交付物（如 1 条 Instagram Reel）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deliverable {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_count() -> u32 {
    1
}

/// 消息发送方（渠道侧身份）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    pub name: Option<String>,
    pub platform: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedBrand {
    pub name: Option<String>,
    pub contact_person: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedBudget {
    #[serde(default)]
    pub mentioned: bool,
    pub amount: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedCampaign {
    pub deliverables: Option<Vec<Deliverable>>,
    pub budget: Option<ExtractedBudget>,
    pub platform: Option<String>,
    pub content_type: Option<String>,
    pub timeline: Option<String>,
}

/// 抽取协作方给出的结构化内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedPayload {
    pub brand: Option<ExtractedBrand>,
    pub campaign: Option<ExtractedCampaign>,
    pub urgency: Option<String>,
    pub additional_notes: Option<String>,
}

/// 入站事件 `inquiry.extracted`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InquiryExtracted {
    pub inquiry_id: Option<String>,
    #[serde(default)]
    pub source: String,
    pub thread_key: Option<String>,
    pub creator_id: Option<String>,
    pub sender: Option<Sender>,
    pub extracted: Option<ExtractedPayload>,
}

/// 合并后的品牌上下文（每个 inquiry 一份，只增不删）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrandContext {
    pub inquiry_id: String,
    pub deal_id: Option<String>,
    pub thread_key: String,
    pub creator_id: String,
    pub source: String,
    pub counterpart_id: Option<String>,
    /// 原始询价中的发件人名（品牌名兜底之一）
    pub counterpart_name: Option<String>,
    pub brand_name: Option<String>,
    pub contact_person: Option<String>,
    pub contact_email: Option<String>,
    pub deliverables: Vec<Deliverable>,
    pub proposed_budget: Option<f64>,
    pub currency: String,
    pub platform: Option<String>,
    pub content_type: Option<String>,
    pub timeline: Option<String>,
    pub urgency: Option<String>,
    pub additional_notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BrandContext {
    pub fn new(inquiry_id: impl Into<String>, thread_key: impl Into<String>, creator_id: impl Into<String>) -> Self {
        Self {
            inquiry_id: inquiry_id.into(),
            deal_id: None,
            thread_key: thread_key.into(),
            creator_id: creator_id.into(),
            source: String::new(),
            counterpart_id: None,
            counterpart_name: None,
            brand_name: None,
            contact_person: None,
            contact_email: None,
            deliverables: Vec::new(),
            proposed_budget: None,
            currency: "INR".to_string(),
            platform: None,
            content_type: None,
            timeline: None,
            urgency: None,
            additional_notes: None,
            updated_at: Utc::now(),
        }
    }

    /// 除 updated_at 外内容是否一致
    pub fn same_content(&self, other: &BrandContext) -> bool {
        let mut a = self.clone();
        a.updated_at = other.updated_at;
        &a == other
    }

    /// 谈判历史与推理上下文使用的 key：已关联 deal 用 deal_id，否则用 inquiry_id
    pub fn deal_key(&self) -> &str {
        self.deal_id.as_deref().unwrap_or(&self.inquiry_id)
    }
}
