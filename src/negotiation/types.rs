//! 谈判决策与谈判轮次

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 决策动作（带标签的变体，数额只在需要时出现）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionAction {
    Accept {
        amount: f64,
    },
    Counter {
        #[serde(rename = "counterOffer")]
        counter_offer: f64,
    },
    Escalate {
        reason: String,
    },
    Decline {
        reason: String,
    },
}

impl DecisionAction {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionAction::Accept { .. } => "accept",
            DecisionAction::Counter { .. } => "counter",
            DecisionAction::Escalate { .. } => "escalate",
            DecisionAction::Decline { .. } => "decline",
        }
    }

    /// 我方给出的数额（接受价或还价）
    pub fn amount(&self) -> Option<f64> {
        match self {
            DecisionAction::Accept { amount } => Some(*amount),
            DecisionAction::Counter { counter_offer } => Some(*counter_offer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    #[serde(flatten)]
    pub action: DecisionAction,
    pub message: String,
    pub reasoning: String,
    /// 0–100，仅供参考
    pub confidence: u8,
    /// 决策所依据的品牌报价与市场价
    pub offer: Option<f64>,
    pub market_rate: Option<f64>,
}

impl Decision {
    /// 写入推理日志的参数
    pub fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "action": self.action,
            "offer": self.offer,
            "marketRate": self.market_rate,
            "confidence": self.confidence,
        })
    }
}

/// 谈判历史中的一轮（品牌报价或我方回应）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationRound {
    pub round: u32,
    pub timestamp: DateTime<Utc>,
    pub from_brand: bool,
    pub offer: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_format() {
        let decision = Decision {
            action: DecisionAction::Counter {
                counter_offer: 17500.0,
            },
            message: "m".to_string(),
            reasoning: "r".to_string(),
            confidence: 70,
            offer: Some(15000.0),
            market_rate: Some(20000.0),
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["action"], "counter");
        assert_eq!(json["counterOffer"], 17500.0);
        assert_eq!(json["marketRate"], 20000.0);

        let back: Decision = serde_json::from_value(json).unwrap();
        assert_eq!(back, decision);
    }
}
