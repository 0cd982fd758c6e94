//! 上下文合并器
//!
//! 消费 `inquiry.extracted` 事件，与该 inquiry 已有的 BrandContext 做非破坏性合并：
//! - 新的非空 deliverables 替换旧值，空/缺失保留旧值
//! - 新的非空预算替换旧值，null 保留旧值
//! - platform / contentType 取最新的非空值，都没有时从交付物类型推断
//!
//! 合并结果持久化后发出 `context.updated`（完整上下文，不是 diff）。

use std::sync::Arc;

use chrono::Utc;

use crate::context::thread::{counterpart_id, derive_thread_key, resolve_deal, DealDirectory};
use crate::context::{BrandContext, Deliverable, InquiryExtracted};
use crate::core::{DealError, DealEvent, EventBus};
use crate::store::{get_json, put_json, KvStore, Namespace};

pub struct ContextMerger {
    store: Arc<dyn KvStore>,
    directory: Arc<dyn DealDirectory>,
    events: EventBus,
    default_creator_id: String,
}

impl ContextMerger {
    pub fn new(
        store: Arc<dyn KvStore>,
        directory: Arc<dyn DealDirectory>,
        events: EventBus,
        default_creator_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            events,
            default_creator_id: default_creator_id.into(),
        }
    }

    pub fn load(&self, inquiry_id: &str) -> Result<Option<BrandContext>, DealError> {
        get_json(self.store.as_ref(), Namespace::BrandContexts, inquiry_id)
    }

    /// 合并一次抽取事件；缺少 inquiryId 或抽取内容时记录告警并返回 None（不报错）
    ///
    /// 调用方需保证同一 inquiry 的 merge 串行执行（读旧值 → 合并 → 写回）。
    pub async fn merge(&self, event: &InquiryExtracted) -> Result<Option<BrandContext>, DealError> {
        let Some(inquiry_id) = event
            .inquiry_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            tracing::warn!(source = %event.source, "inquiry.extracted without inquiryId, ignored");
            return Ok(None);
        };
        if event.extracted.is_none() {
            tracing::warn!(inquiry_id, "inquiry.extracted without extraction payload, ignored");
            return Ok(None);
        }

        let prior = self.load(inquiry_id)?;
        let base = match &prior {
            Some(ctx) => ctx.clone(),
            None => {
                let creator = event
                    .creator_id
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| self.default_creator_id.clone());
                let thread_key = derive_thread_key(
                    event.thread_key.as_deref(),
                    &event.source,
                    event.sender.as_ref(),
                    inquiry_id,
                );
                BrandContext::new(inquiry_id, thread_key, creator)
            }
        };

        let mut merged = apply_extraction(&base, event);
        if merged.deal_id.is_none() {
            merged.deal_id = resolve_deal(self.directory.as_ref(), &merged).await;
            if let Some(deal_id) = &merged.deal_id {
                tracing::info!(inquiry_id, deal_id = %deal_id, "inquiry linked to existing deal");
            }
        }

        match &prior {
            Some(p) if merged.same_content(p) => merged.updated_at = p.updated_at,
            _ => merged.updated_at = Utc::now(),
        }

        put_json(self.store.as_ref(), Namespace::BrandContexts, inquiry_id, &merged)?;
        tracing::info!(
            inquiry_id,
            deliverables = merged.deliverables.len(),
            budget = ?merged.proposed_budget,
            platform = ?merged.platform,
            content_type = ?merged.content_type,
            "brand context merged"
        );

        self.events.emit(DealEvent::ContextUpdated {
            context: merged.clone(),
        });
        Ok(Some(merged))
    }
}

/// 纯合并：不读写存储，便于单测
pub fn apply_extraction(base: &BrandContext, event: &InquiryExtracted) -> BrandContext {
    let mut ctx = base.clone();

    if !event.source.trim().is_empty() {
        ctx.source = event.source.trim().to_lowercase();
    }
    if let Some(id) = counterpart_id(event.sender.as_ref()) {
        ctx.counterpart_id = Some(id);
    }
    if let Some(name) = event.sender.as_ref().and_then(|s| non_empty(s.name.as_deref())) {
        ctx.counterpart_name = Some(name);
    }
    if let Some(creator) = non_empty(event.creator_id.as_deref()) {
        ctx.creator_id = creator;
    }

    let Some(payload) = &event.extracted else {
        return ctx;
    };

    if let Some(brand) = &payload.brand {
        prefer_newer(&mut ctx.brand_name, brand.name.as_deref());
        prefer_newer(&mut ctx.contact_person, brand.contact_person.as_deref());
        prefer_newer(&mut ctx.contact_email, brand.email.as_deref());
    }
    prefer_newer(&mut ctx.urgency, payload.urgency.as_deref());
    prefer_newer(&mut ctx.additional_notes, payload.additional_notes.as_deref());

    let mut deliverables_replaced = false;
    let mut explicit_platform = None;
    let mut explicit_content_type = None;

    if let Some(campaign) = &payload.campaign {
        let incoming = normalize_deliverables(campaign.deliverables.as_deref().unwrap_or_default());
        if !incoming.is_empty() {
            deliverables_replaced = incoming != ctx.deliverables;
            ctx.deliverables = incoming;
        }

        if let Some(budget) = &campaign.budget {
            if let Some(amount) = budget.amount.filter(|a| a.is_finite() && *a > 0.0) {
                ctx.proposed_budget = Some(amount);
            }
            if let Some(currency) = non_empty(budget.currency.as_deref()) {
                ctx.currency = currency.to_uppercase();
            }
        }

        explicit_platform = non_empty(campaign.platform.as_deref()).map(|p| p.to_lowercase());
        explicit_content_type =
            non_empty(campaign.content_type.as_deref()).map(|c| c.to_lowercase());
        prefer_newer(&mut ctx.timeline, campaign.timeline.as_deref());
    }

    let (inferred_platform, inferred_content_type) = infer_platform_and_type(&ctx.deliverables);
    ctx.platform = pick_dimension(
        explicit_platform,
        ctx.platform.take(),
        inferred_platform,
        deliverables_replaced,
    );
    ctx.content_type = pick_dimension(
        explicit_content_type,
        ctx.content_type.take(),
        inferred_content_type,
        deliverables_replaced,
    );

    ctx
}

/// 上游显式值 > （交付物刚被替换时的）推断值 > 旧值 > 推断值
fn pick_dimension(
    explicit: Option<String>,
    prior: Option<String>,
    inferred: Option<String>,
    deliverables_replaced: bool,
) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }
    if deliverables_replaced && inferred.is_some() {
        return inferred;
    }
    prior.or(inferred)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn prefer_newer(slot: &mut Option<String>, incoming: Option<&str>) {
    if let Some(v) = non_empty(incoming) {
        *slot = Some(v);
    }
}

/// 清洗交付物：去首尾空白、count 至少为 1、丢弃完全空的项、去掉同一批内的重复项
fn normalize_deliverables(raw: &[Deliverable]) -> Vec<Deliverable> {
    let mut out: Vec<Deliverable> = Vec::with_capacity(raw.len());
    for d in raw {
        let kind = d.kind.trim().to_string();
        let description = non_empty(d.description.as_deref());
        if kind.is_empty() && description.is_none() {
            continue;
        }
        let item = Deliverable {
            kind,
            count: d.count.max(1),
            description,
        };
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// 从交付物类型字符串推断平台与内容形式（如 instagram_reel -> instagram + reel）
pub fn infer_platform_and_type(deliverables: &[Deliverable]) -> (Option<String>, Option<String>) {
    let mut platform = None;
    let mut content_type = None;
    for d in deliverables {
        let kind = d.kind.to_lowercase();
        if platform.is_none() {
            platform = if kind.contains("instagram") || kind.contains("insta") || kind.contains("reel") {
                Some("instagram")
            } else if kind.contains("youtube") || kind.contains("short") {
                Some("youtube")
            } else if kind.contains("tiktok") {
                Some("tiktok")
            } else if kind.contains("linkedin") {
                Some("linkedin")
            } else {
                None
            };
        }
        if content_type.is_none() {
            content_type = ["reel", "short", "story", "video", "post", "live"]
                .into_iter()
                .find(|t| kind.contains(t));
        }
        if platform.is_some() && content_type.is_some() {
            break;
        }
    }
    (platform.map(String::from), content_type.map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::thread::InMemoryDealDirectory;
    use crate::context::{ExtractedBudget, ExtractedCampaign, ExtractedPayload};
    use crate::store::MemoryStore;

    fn event(deliverables: Option<Vec<Deliverable>>, budget: Option<f64>, platform: Option<&str>) -> InquiryExtracted {
        InquiryExtracted {
            inquiry_id: Some("INQ-1".to_string()),
            source: "email".to_string(),
            extracted: Some(ExtractedPayload {
                campaign: Some(ExtractedCampaign {
                    deliverables,
                    budget: Some(ExtractedBudget {
                        mentioned: budget.is_some(),
                        amount: budget,
                        currency: None,
                    }),
                    platform: platform.map(String::from),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn reel(count: u32) -> Deliverable {
        Deliverable {
            kind: "reel".to_string(),
            count,
            description: None,
        }
    }

    fn merger() -> ContextMerger {
        ContextMerger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryDealDirectory::new()),
            EventBus::new(16),
            "creator-1",
        )
    }

    #[test]
    fn test_partial_update_never_clears() {
        let base = BrandContext::new("INQ-1", "email:x", "creator-1");
        let first = apply_extraction(&base, &event(Some(vec![reel(1)]), Some(20000.0), None));
        let second = apply_extraction(&first, &event(Some(vec![]), None, None));

        assert_eq!(second.deliverables, vec![reel(1)]);
        assert_eq!(second.proposed_budget, Some(20000.0));
    }

    #[test]
    fn test_newer_values_replace() {
        let base = BrandContext::new("INQ-1", "email:x", "creator-1");
        let first = apply_extraction(&base, &event(Some(vec![reel(1)]), Some(20000.0), Some("instagram")));
        let second = apply_extraction(&first, &event(Some(vec![reel(2)]), Some(25000.0), None));

        assert_eq!(second.deliverables, vec![reel(2)]);
        assert_eq!(second.proposed_budget, Some(25000.0));
        assert_eq!(second.platform.as_deref(), Some("instagram"));
    }

    #[test]
    fn test_duplicate_deliverables_collapsed() {
        let base = BrandContext::new("INQ-1", "email:x", "creator-1");
        let merged = apply_extraction(&base, &event(Some(vec![reel(1), reel(1)]), None, None));
        assert_eq!(merged.deliverables.len(), 1);
    }

    #[test]
    fn test_platform_inferred_from_deliverable_type() {
        let base = BrandContext::new("INQ-1", "email:x", "creator-1");
        let d = Deliverable {
            kind: "instagram_reel".to_string(),
            count: 1,
            description: None,
        };
        let merged = apply_extraction(&base, &event(Some(vec![d]), None, None));
        assert_eq!(merged.platform.as_deref(), Some("instagram"));
        assert_eq!(merged.content_type.as_deref(), Some("reel"));
    }

    #[test]
    fn test_explicit_platform_beats_inference() {
        let base = BrandContext::new("INQ-1", "email:x", "creator-1");
        let merged = apply_extraction(&base, &event(Some(vec![reel(1)]), None, Some("Facebook")));
        assert_eq!(merged.platform.as_deref(), Some("facebook"));
        assert_eq!(merged.content_type.as_deref(), Some("reel"));
    }

    #[test]
    fn test_infer_youtube_short() {
        let d = Deliverable {
            kind: "youtube_short".to_string(),
            count: 3,
            description: None,
        };
        let (platform, content) = infer_platform_and_type(&[d]);
        assert_eq!(platform.as_deref(), Some("youtube"));
        assert_eq!(content.as_deref(), Some("short"));
    }

    #[tokio::test]
    async fn test_merge_same_payload_twice_is_identical() {
        let merger = merger();
        let e = event(Some(vec![reel(1)]), Some(20000.0), Some("instagram"));

        let first = merger.merge(&e).await.unwrap().unwrap();
        let second = merger.merge(&e).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(merger.load("INQ-1").unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_missing_inquiry_id_is_noop() {
        let merger = merger();
        let mut e = event(Some(vec![reel(1)]), Some(20000.0), None);
        e.inquiry_id = None;
        assert!(merger.merge(&e).await.unwrap().is_none());

        let mut e = event(None, None, None);
        e.extracted = None;
        assert!(merger.merge(&e).await.unwrap().is_none());
        assert!(merger.load("INQ-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_emits_full_context() {
        let merger = merger();
        let mut rx = merger.events.subscribe();
        merger
            .merge(&event(Some(vec![reel(1)]), Some(20000.0), None))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            DealEvent::ContextUpdated { context } => {
                assert_eq!(context.inquiry_id, "INQ-1");
                assert_eq!(context.proposed_budget, Some(20000.0));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
