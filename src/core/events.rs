//! 出站事件：每条事件都是完整、自包含的载荷（不是 diff），订阅方无需持有历史状态

use serde::Serialize;
use tokio::sync::broadcast;

use crate::context::BrandContext;
use crate::negotiation::Decision;
use crate::rate::RateSnapshot;

/// 出站事件（可序列化为 JSON，`topic` 字段区分类型）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic")]
pub enum DealEvent {
    /// 上下文合并完成，携带完整的合并结果
    #[serde(rename = "context.updated")]
    ContextUpdated { context: BrandContext },

    /// 就绪门控触发新一轮报价评估
    #[serde(rename = "negotiation.evaluation_requested", rename_all = "camelCase")]
    EvaluationRequested {
        inquiry_id: String,
        deal_id: Option<String>,
        creator_id: String,
        round: u32,
        signature: String,
        forced: bool,
    },

    /// 报价快照已写入（含失败快照）
    #[serde(rename = "rate.recommendation_generated")]
    RecommendationGenerated { snapshot: RateSnapshot },

    /// 决策引擎给出本轮决策（尚未执行发送）
    #[serde(rename = "negotiation.decided", rename_all = "camelCase")]
    NegotiationDecided {
        inquiry_id: String,
        deal_key: String,
        decision_id: String,
        round: u32,
        decision: Decision,
    },
}

impl DealEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DealEvent::ContextUpdated { .. } => "context.updated",
            DealEvent::EvaluationRequested { .. } => "negotiation.evaluation_requested",
            DealEvent::RecommendationGenerated { .. } => "rate.recommendation_generated",
            DealEvent::NegotiationDecided { .. } => "negotiation.decided",
        }
    }
}

/// 事件总线：broadcast 通道的薄封装，没有订阅者时丢弃事件
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DealEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: DealEvent) {
        tracing::debug!(topic = event.topic(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DealEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_topic() {
        let event = DealEvent::EvaluationRequested {
            inquiry_id: "INQ-1".to_string(),
            deal_id: None,
            creator_id: "creator-1".to_string(),
            round: 1,
            signature: "abc".to_string(),
            forced: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "negotiation.evaluation_requested");
        assert_eq!(json["inquiryId"], "INQ-1");
        assert_eq!(json["round"], 1);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(DealEvent::ContextUpdated {
            context: BrandContext::new("INQ-1", "email:x", "creator-1"),
        });
    }
}
