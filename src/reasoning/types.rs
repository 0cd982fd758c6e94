//! 推理上下文：只追加的事件日志 + 由事件重建的投影


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deal 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    #[default]
    Inquiry,
    Negotiating,
    /// 已接受
    Active,
    Declined,
    /// 已转人工
    Escalated,
    Completed,
}

impl DealStage {
    /// 到达后不再处理品牌报价
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DealStage::Inquiry | DealStage::Negotiating)
    }

    pub fn can_transition_to(&self, to: DealStage) -> bool {
        use DealStage::*;
        match (self, to) {
            (from, to) if *from == to => false,
            (Inquiry, _) => true,
            (Negotiating, Inquiry) => false,
            (Negotiating, _) => true,
            (Active, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DealStage::Inquiry => "inquiry",
            DealStage::Negotiating => "negotiating",
            DealStage::Active => "active",
            DealStage::Declined => "declined",
            DealStage::Escalated => "escalated",
            DealStage::Completed => "completed",
        }
    }
}

/// 日志中的一条事件；投影只读这些事件，不原地修改历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReasoningEvent {
    Fact {
        key: String,
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    Thought {
        stage: DealStage,
        thought: String,
        confidence: u8,
        factors: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Decision {
        id: String,
        decision_type: String,
        reasoning: String,
        parameters: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Correction {
        original_thought: String,
        new_thought: String,
        reason: String,
        trigger: String,
    },
    #[serde(rename_all = "camelCase")]
    Executed {
        decision_id: String,
    },
    StageChanged {
        from: DealStage,
        to: DealStage,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ReasoningEvent,
}

/// 持久化文档：一个 deal 一份
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningLog {
    pub deal_key: String,
    pub events: Vec<ReasoningEntry>,
}

impl ReasoningLog {
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtEntry {
    pub stage: DealStage,
    pub thought: String,
    pub confidence: u8,
    pub factors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub decision_type: String,
    pub reasoning: String,
    pub parameters: serde_json::Value,
    pub executed: bool,
    pub timestamp: DateTime<Utc>,
}

impl DecisionEntry {
    pub fn offer(&self) -> Option<f64> {
        self.parameters.get("offer").and_then(|v| v.as_f64())
    }

    pub fn market_rate(&self) -> Option<f64> {
        self.parameters.get("marketRate").and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionEntry {
    pub original_thought: String,
    pub new_thought: String,
    pub reason: String,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

/// 由事件日志重建的推理上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningContext {
    pub deal_id: String,
    pub stage: DealStage,
    /// 按发生顺序排列的 `key=value`，同一 key 的旧值保留
    pub key_facts: Vec<String>,
    pub reasoning_chain: Vec<ThoughtEntry>,
    pub decisions: Vec<DecisionEntry>,
    pub corrections: Vec<CorrectionEntry>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReasoningContext {
    pub fn project(log: &ReasoningLog) -> Self {
        let mut ctx = ReasoningContext {
            deal_id: log.deal_key.clone(),
            ..Default::default()
        };
        for entry in &log.events {
            ctx.apply(entry);
        }
        ctx
    }

    fn apply(&mut self, entry: &ReasoningEntry) {
        let at = entry.at;
        match &entry.event {
            ReasoningEvent::Fact { key, value } => {
                self.key_facts.push(format!("{}={}", key, value));
            }
            ReasoningEvent::Thought {
                stage,
                thought,
                confidence,
                factors,
            } => self.reasoning_chain.push(ThoughtEntry {
                stage: *stage,
                thought: thought.clone(),
                confidence: *confidence,
                factors: factors.clone(),
                timestamp: at,
            }),
            ReasoningEvent::Decision {
                id,
                decision_type,
                reasoning,
                parameters,
            } => self.decisions.push(DecisionEntry {
                id: id.clone(),
                decision_type: decision_type.clone(),
                reasoning: reasoning.clone(),
                parameters: parameters.clone(),
                executed: false,
                timestamp: at,
            }),
            ReasoningEvent::Correction {
                original_thought,
                new_thought,
                reason,
                trigger,
            } => self.corrections.push(CorrectionEntry {
                original_thought: original_thought.clone(),
                new_thought: new_thought.clone(),
                reason: reason.clone(),
                trigger: trigger.clone(),
                timestamp: at,
            }),
            ReasoningEvent::Executed { decision_id } => {
                if let Some(d) = self.decisions.iter_mut().find(|d| &d.id == decision_id) {
                    d.executed = true;
                }
            }
            ReasoningEvent::StageChanged { to, .. } => self.stage = *to,
        }
        self.updated_at = Some(at);
    }

    pub fn pending_decisions(&self) -> impl Iterator<Item = &DecisionEntry> {
        self.decisions.iter().filter(|d| !d.executed)
    }

    /// 某个 key 的最新值
    pub fn fact(&self, key: &str) -> Option<&str> {
        self.key_facts
            .iter()
            .rev()
            .find_map(|f| f.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
    }

    /// 最近 n 条推理，供顾问 prompt 使用
    pub fn recent_thoughts(&self, n: usize) -> Vec<String> {
        let skip = self.reasoning_chain.len().saturating_sub(n);
        self.reasoning_chain
            .iter()
            .skip(skip)
            .map(|t| t.thought.clone())
            .collect()
    }
}
