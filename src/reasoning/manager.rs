//! 推理上下文管理
//!
//! 每个 deal 一份只追加的事件日志；读取时由事件重建投影。
//! 同一 deal 可能被多个 inquiry 共享，追加使用 CAS，冲突时有限次重试。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::core::DealError;
use crate::reasoning::{DealStage, ReasoningContext, ReasoningEntry, ReasoningEvent, ReasoningLog};
use crate::store::{KvStore, Namespace};

const APPEND_RETRIES: usize = 3;

pub struct ReasoningManager {
    store: Arc<dyn KvStore>,
}

impl ReasoningManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, deal_key: &str) -> Result<ReasoningContext, DealError> {
        Ok(ReasoningContext::project(&self.read_log(deal_key)?.1))
    }

    pub fn add_fact(&self, deal_key: &str, key: &str, value: &str) -> Result<(), DealError> {
        self.append(
            deal_key,
            vec![ReasoningEvent::Fact {
                key: key.to_string(),
                value: value.to_string(),
            }],
        )
    }

    pub fn add_thought(
        &self,
        deal_key: &str,
        stage: DealStage,
        thought: &str,
        confidence: u8,
        factors: Vec<String>,
    ) -> Result<(), DealError> {
        self.append(
            deal_key,
            vec![ReasoningEvent::Thought {
                stage,
                thought: thought.to_string(),
                confidence: confidence.min(100),
                factors,
            }],
        )
    }

    /// 记录一次决策（未执行），返回决策 id
    pub fn record_decision(
        &self,
        deal_key: &str,
        decision_type: &str,
        reasoning: &str,
        parameters: serde_json::Value,
    ) -> Result<String, DealError> {
        let id = format!("dec_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        self.append(
            deal_key,
            vec![ReasoningEvent::Decision {
                id: id.clone(),
                decision_type: decision_type.to_string(),
                reasoning: reasoning.to_string(),
                parameters,
            }],
        )?;
        Ok(id)
    }

    pub fn record_correction(
        &self,
        deal_key: &str,
        original_thought: &str,
        new_thought: &str,
        reason: &str,
        trigger: &str,
    ) -> Result<(), DealError> {
        tracing::info!(deal_key, trigger, "reasoning self-correction recorded");
        self.append(
            deal_key,
            vec![ReasoningEvent::Correction {
                original_thought: original_thought.to_string(),
                new_thought: new_thought.to_string(),
                reason: reason.to_string(),
                trigger: trigger.to_string(),
            }],
        )
    }

    /// 标记决策已执行；未知或已执行的决策返回 false
    pub fn mark_executed(&self, deal_key: &str, decision_id: &str) -> Result<bool, DealError> {
        let ctx = self.load(deal_key)?;
        match ctx.decisions.iter().find(|d| d.id == decision_id) {
            None => {
                tracing::warn!(deal_key, decision_id, "mark_executed for unknown decision");
                Ok(false)
            }
            Some(d) if d.executed => Ok(false),
            Some(_) => {
                self.append(
                    deal_key,
                    vec![ReasoningEvent::Executed {
                        decision_id: decision_id.to_string(),
                    }],
                )?;
                Ok(true)
            }
        }
    }

    /// 推进阶段；不允许的迁移（含终态之后）记录告警并返回 false
    pub fn advance_stage(&self, deal_key: &str, to: DealStage) -> Result<bool, DealError> {
        let from = self.load(deal_key)?.stage;
        if from == to {
            return Ok(false);
        }
        if !from.can_transition_to(to) {
            tracing::warn!(deal_key, from = from.as_str(), to = to.as_str(), "stage transition rejected");
            return Ok(false);
        }
        self.append(deal_key, vec![ReasoningEvent::StageChanged { from, to }])?;
        tracing::info!(deal_key, from = from.as_str(), to = to.as_str(), "deal stage changed");
        Ok(true)
    }

    /// 把 `from` 的事件按原时间戳接到 `to` 之后，追加一条 `adopted_from` 事实，随后删除 `from`
    ///
    /// inquiry 在谈判中途才关联到 deal 时使用，保证阶段、决策与修正不丢失。返回迁移的事件数。
    pub fn adopt(&self, from: &str, to: &str) -> Result<usize, DealError> {
        let (_, moved) = self.read_log(from)?;
        if moved.events.is_empty() || from == to {
            return Ok(0);
        }
        let marker = ReasoningEntry {
            at: Utc::now(),
            event: ReasoningEvent::Fact {
                key: "adopted_from".to_string(),
                value: from.to_string(),
            },
        };
        for _ in 0..APPEND_RETRIES {
            let (raw_prior, mut log) = self.read_log(to)?;
            log.events.extend(moved.events.iter().cloned());
            log.events.push(marker.clone());
            let raw = serde_json::to_string(&log)?;
            if self.store.compare_and_swap(
                Namespace::ReasoningContexts,
                to,
                raw_prior.as_deref(),
                &raw,
            )? {
                self.store.delete(Namespace::ReasoningContexts, from)?;
                tracing::info!(from, to, events = moved.events.len(), "reasoning context moved to deal");
                return Ok(moved.events.len());
            }
        }
        Err(DealError::WriteConflict {
            namespace: Namespace::ReasoningContexts.as_str().to_string(),
            key: to.to_string(),
        })
    }

    /// 审计导出：投影 + 原始事件
    pub fn export(&self, deal_key: &str) -> Result<serde_json::Value, DealError> {
        let (_, log) = self.read_log(deal_key)?;
        let context = ReasoningContext::project(&log);
        Ok(serde_json::json!({
            "context": context,
            "events": log.events,
        }))
    }

    /// 删除不活跃超过 inactive_days 的推理上下文，返回删除数量
    pub fn collect_garbage(&self, now: DateTime<Utc>, inactive_days: i64) -> Result<usize, DealError> {
        let cutoff = now - Duration::days(inactive_days);
        let mut removed = 0;
        for (key, raw) in self.store.scan_prefix(Namespace::ReasoningContexts, "")? {
            let log: ReasoningLog = match serde_json::from_str(&raw) {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(deal_key = %key, error = %e, "unreadable reasoning log skipped by gc");
                    continue;
                }
            };
            let stale = log.last_activity().map(|t| t < cutoff).unwrap_or(true);
            if stale && self.store.delete(Namespace::ReasoningContexts, &key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, inactive_days, "reasoning contexts collected");
        }
        Ok(removed)
    }

    fn read_log(&self, deal_key: &str) -> Result<(Option<String>, ReasoningLog), DealError> {
        match self.store.get(Namespace::ReasoningContexts, deal_key)? {
            Some(raw) => {
                let log = serde_json::from_str(&raw)?;
                Ok((Some(raw), log))
            }
            None => Ok((
                None,
                ReasoningLog {
                    deal_key: deal_key.to_string(),
                    events: Vec::new(),
                },
            )),
        }
    }

    fn append(&self, deal_key: &str, events: Vec<ReasoningEvent>) -> Result<(), DealError> {
        for _ in 0..APPEND_RETRIES {
            let (raw_prior, mut log) = self.read_log(deal_key)?;
            let at = Utc::now();
            log.events
                .extend(events.iter().cloned().map(|event| ReasoningEntry { at, event }));
            let raw = serde_json::to_string(&log)?;
            if self.store.compare_and_swap(
                Namespace::ReasoningContexts,
                deal_key,
                raw_prior.as_deref(),
                &raw,
            )? {
                return Ok(());
            }
            tracing::debug!(deal_key, "reasoning append raced, retrying");
        }
        Err(DealError::WriteConflict {
            namespace: Namespace::ReasoningContexts.as_str().to_string(),
            key: deal_key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> ReasoningManager {
        ReasoningManager::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_decision_lifecycle() {
        let m = manager();
        let id = m
            .record_decision("deal-1", "counter", "mid band", serde_json::json!({"offer": 15000.0}))
            .unwrap();
        assert!(id.starts_with("dec_"));
        assert!(!m.load("deal-1").unwrap().decisions[0].executed);

        assert!(m.mark_executed("deal-1", &id).unwrap());
        assert!(!m.mark_executed("deal-1", &id).unwrap());
        assert!(!m.mark_executed("deal-1", "dec_unknown").unwrap());
        assert!(m.load("deal-1").unwrap().decisions[0].executed);
    }

    #[test]
    fn test_stage_after_terminal_is_rejected() {
        let m = manager();
        assert!(m.advance_stage("deal-1", DealStage::Negotiating).unwrap());
        assert!(m.advance_stage("deal-1", DealStage::Declined).unwrap());
        assert!(!m.advance_stage("deal-1", DealStage::Negotiating).unwrap());
        assert_eq!(m.load("deal-1").unwrap().stage, DealStage::Declined);
    }

    #[test]
    fn test_corrections_append_without_editing_history() {
        let m = manager();
        m.add_thought("deal-1", DealStage::Negotiating, "offer is 75% of market", 70, vec![])
            .unwrap();
        m.record_correction("deal-1", "offer is 75% of market", "offer is 90% of market", "new offer", "brand_offer")
            .unwrap();
        let ctx = m.load("deal-1").unwrap();
        assert_eq!(ctx.reasoning_chain.len(), 1);
        assert_eq!(ctx.reasoning_chain[0].thought, "offer is 75% of market");
        assert_eq!(ctx.corrections.len(), 1);

        let export = m.export("deal-1").unwrap();
        assert_eq!(export["events"].as_array().unwrap().len(), 2);
        assert_eq!(export["context"]["corrections"][0]["trigger"], "brand_offer");
    }

    #[test]
    fn test_adopt_keeps_stage_and_decisions() {
        let m = manager();
        m.advance_stage("INQ-1", DealStage::Negotiating).unwrap();
        let id = m
            .record_decision("INQ-1", "counter", "mid band", serde_json::json!({"offer": 65.0}))
            .unwrap();

        assert_eq!(m.adopt("INQ-1", "deal-1").unwrap(), 2);
        let ctx = m.load("deal-1").unwrap();
        assert_eq!(ctx.stage, DealStage::Negotiating);
        assert_eq!(ctx.decisions[0].id, id);
        assert_eq!(ctx.fact("adopted_from"), Some("INQ-1"));
        assert!(m.load("INQ-1").unwrap().decisions.is_empty());
        assert_eq!(m.adopt("INQ-1", "deal-1").unwrap(), 0);
    }

    #[test]
    fn test_gc_removes_only_inactive() {
        let m = manager();
        m.add_fact("old", "brand", "GlowCo").unwrap();
        m.add_fact("fresh", "brand", "Acme").unwrap();

        // 以 31 天后为「现在」，两者都过期；以当前为「现在」，都不过期
        assert_eq!(m.collect_garbage(Utc::now(), 30).unwrap(), 0);
        assert_eq!(m.collect_garbage(Utc::now() + Duration::days(31), 30).unwrap(), 2);
        assert_eq!(m.load("old").unwrap().key_facts.len(), 0);
    }
}
