//! 策略顾问（可选的外部推理协作方）
//!
//! 只在还价与低于下限两类情况下被咨询；返回值在边界处校验（带标签 JSON），
//! 不合法 / 超时 / 出错都由调用方回退到确定性规则。顾问只能细化还价数额、理由与置信度，不能改变动作。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::core::DealError;
use crate::llm::{LlmClient, Message};
use crate::negotiation::NegotiationRound;

/// 发给顾问的结构化谈判上下文
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorRequest {
    pub deal_key: String,
    pub brand_name: Option<String>,
    pub currency: String,
    pub deliverables: String,
    pub offer: f64,
    pub market_rate: f64,
    pub offer_ratio: f64,
    /// 确定性规则给出的动作（counter / decline / escalate）
    pub proposed_action: String,
    pub deterministic_counter: Option<f64>,
    pub responses_so_far: u32,
    pub max_rounds: u32,
    pub history: Vec<NegotiationRound>,
    pub key_facts: Vec<String>,
    pub recent_thoughts: Vec<String>,
}

/// 顾问建议
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvisorSuggestion {
    /// 给出具体还价数额
    Counter {
        /// 还价数额，必须在品牌报价与市场价之间
        amount: f64,
        reasoning: String,
        /// 0–100
        confidence: f64,
    },
    /// 不给数额，仅补充理由
    Hold { reasoning: String, confidence: f64 },
}

impl AdvisorSuggestion {
    /// 边界校验：理由非空、置信度 0–100、数额为正的有限数
    pub fn validate(self) -> Result<Self, DealError> {
        let (reasoning, confidence) = match &self {
            AdvisorSuggestion::Counter {
                amount,
                reasoning,
                confidence,
            } => {
                if !amount.is_finite() || *amount <= 0.0 {
                    return Err(DealError::AdvisorFailed(format!("invalid counter amount {}", amount)));
                }
                (reasoning, confidence)
            }
            AdvisorSuggestion::Hold {
                reasoning,
                confidence,
            } => (reasoning, confidence),
        };
        if reasoning.trim().is_empty() {
            return Err(DealError::AdvisorFailed("empty reasoning".to_string()));
        }
        if !(0.0..=100.0).contains(confidence) {
            return Err(DealError::AdvisorFailed(format!("confidence {} out of range", confidence)));
        }
        Ok(self)
    }

    pub fn reasoning(&self) -> &str {
        match self {
            AdvisorSuggestion::Counter { reasoning, .. } | AdvisorSuggestion::Hold { reasoning, .. } => {
                reasoning
            }
        }
    }

    pub fn confidence(&self) -> u8 {
        let c = match self {
            AdvisorSuggestion::Counter { confidence, .. } | AdvisorSuggestion::Hold { confidence, .. } => {
                *confidence
            }
        };
        c.round().clamp(0.0, 100.0) as u8
    }
}

#[async_trait]
pub trait StrategicAdvisor: Send + Sync {
    async fn advise(&self, request: &AdvisorRequest) -> Result<AdvisorSuggestion, DealError>;
}

/// 返回建议格式的 JSON Schema，拼入 system prompt
pub fn suggestion_schema_json() -> String {
    let schema = schema_for!(AdvisorSuggestion);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

const SYSTEM_PROMPT: &str = "You advise a content creator's team in a sponsorship rate negotiation. \
You receive the brand's latest offer, the market-tier rate and the negotiation so far. \
Reply with exactly one JSON object and nothing else. Use kind \"counter\" only when you can name a \
counter figure strictly between the offer and the market rate; otherwise use kind \"hold\".";

/// 基于 LLM 的顾问
pub struct LlmAdvisor {
    llm: Arc<dyn LlmClient>,
}

impl LlmAdvisor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl StrategicAdvisor for LlmAdvisor {
    async fn advise(&self, request: &AdvisorRequest) -> Result<AdvisorSuggestion, DealError> {
        let system = format!(
            "{}\n\nJSON Schema of the reply:\n{}",
            SYSTEM_PROMPT,
            suggestion_schema_json()
        );
        let user = serde_json::to_string_pretty(request)?;
        let reply = self
            .llm
            .complete(&[Message::system(system), Message::user(user)])
            .await
            .map_err(DealError::AdvisorFailed)?;
        parse_suggestion(&reply)
    }
}

/// 从回复中取出第一个 JSON 对象（容忍 ```json 代码块与前后说明文字）
pub fn parse_suggestion(reply: &str) -> Result<AdvisorSuggestion, DealError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &reply[s..=e],
        _ => {
            return Err(DealError::AdvisorFailed(
                "reply contains no JSON object".to_string(),
            ))
        }
    };
    let suggestion: AdvisorSuggestion = serde_json::from_str(json)
        .map_err(|e| DealError::AdvisorFailed(format!("invalid suggestion: {}", e)))?;
    suggestion.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn request() -> AdvisorRequest {
        AdvisorRequest {
            deal_key: "INQ-1".to_string(),
            brand_name: Some("GlowCo".to_string()),
            currency: "INR".to_string(),
            deliverables: "1x Reel".to_string(),
            offer: 15000.0,
            market_rate: 20000.0,
            offer_ratio: 0.75,
            proposed_action: "counter".to_string(),
            deterministic_counter: Some(17500.0),
            responses_so_far: 0,
            max_rounds: 3,
            history: vec![],
            key_facts: vec![],
            recent_thoughts: vec![],
        }
    }

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"kind\": \"counter\", \"amount\": 18000, \"reasoning\": \"urgent launch\", \"confidence\": 72}\n```";
        let s = parse_suggestion(reply).unwrap();
        assert_eq!(
            s,
            AdvisorSuggestion::Counter {
                amount: 18000.0,
                reasoning: "urgent launch".to_string(),
                confidence: 72.0
            }
        );
        assert_eq!(s.confidence(), 72);
    }

    #[test]
    fn test_rejects_invalid_suggestions() {
        assert!(parse_suggestion("no json here").is_err());
        assert!(parse_suggestion(r#"{"kind": "accept", "reasoning": "x", "confidence": 50}"#).is_err());
        assert!(parse_suggestion(r#"{"kind": "hold", "reasoning": "x", "confidence": 150}"#).is_err());
        assert!(parse_suggestion(r#"{"kind": "counter", "amount": -5, "reasoning": "x", "confidence": 50}"#).is_err());
        assert!(parse_suggestion(r#"{"kind": "hold", "reasoning": " ", "confidence": 50}"#).is_err());
    }

    #[test]
    fn test_schema_mentions_variants() {
        let schema = suggestion_schema_json();
        assert!(schema.contains("counter"));
        assert!(schema.contains("hold"));
    }

    #[tokio::test]
    async fn test_llm_advisor_sends_schema_and_context() {
        let llm = Arc::new(MockLlmClient::new().with_reply(
            r#"{"kind": "hold", "reasoning": "midpoint is fine", "confidence": 60}"#,
        ));
        let advisor = LlmAdvisor::new(llm.clone());
        let s = advisor.advise(&request()).await.unwrap();
        assert_eq!(s.reasoning(), "midpoint is fine");

        let prompt = llm.last_prompt();
        assert!(prompt[0].content.contains("JSON Schema"));
        assert!(prompt[1].content.contains("\"offerRatio\": 0.75"));
    }

    #[tokio::test]
    async fn test_llm_error_maps_to_advisor_failure() {
        let advisor = LlmAdvisor::new(Arc::new(MockLlmClient::new().with_error("rate limited")));
        let err = advisor.advise(&request()).await.unwrap_err();
        assert!(matches!(err, DealError::AdvisorFailed(_)));
    }
}
