//! 编排主流程
//!
//! 抽取事件 → 上下文合并 → 就绪门控 →（新指纹或强制）报价快照 → 决策引擎 → 记录我方回应。
//! 同一 inquiry 的所有操作经 KeyedSerializer 串行执行，不同 inquiry 并行。
//! 谈判历史与推理上下文按 deal 共享，写入前再取 `deal:{dealKey}` 锁（总是先 inquiry 后 deal）。
//! 任何错误都交给 FailurePolicy 记录并决定动作，不向调用方抛出。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, OwnedMutexGuard};

use crate::config::{AppConfig, NegotiationSection};
use crate::context::{BrandContext, ContextMerger, InquiryExtracted};
use crate::core::{DealError, DealEvent, EventBus, FailurePolicy, KeyedSerializer, PipelineBuilder};
use crate::negotiation::{
    latest_brand_offer, DecisionEngine, NegotiationHistory, NegotiationRound, RecordedDecision,
};
use crate::rate::{RateSnapshot, SnapshotOrchestrator, SnapshotStatus};
use crate::readiness::{ReadinessGate, ReadinessOutcome, ReadinessRecord};
use crate::reasoning::ReasoningManager;

/// 一次操作的可观察结果（测试与驱动程序使用）
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub context: Option<BrandContext>,
    pub readiness: Option<ReadinessOutcome>,
    pub snapshot: Option<RateSnapshot>,
    pub decision: Option<RecordedDecision>,
}

/// 驱动程序的输入命令（每行一个 JSON，`type` 区分）
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineCommand {
    /// inquiry.extracted 事件
    Extracted(InquiryExtracted),
    #[serde(rename_all = "camelCase")]
    Force { inquiry_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        inquiry_id: String,
        amount: f64,
        #[serde(default)]
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Executed {
        inquiry_id: String,
        decision_id: String,
    },
}

pub struct Pipeline {
    pub(crate) negotiation: NegotiationSection,
    pub(crate) gc_inactive_days: i64,
    pub(crate) merger: ContextMerger,
    pub(crate) gate: ReadinessGate,
    pub(crate) snapshots: SnapshotOrchestrator,
    pub(crate) engine: DecisionEngine,
    pub(crate) history: NegotiationHistory,
    pub(crate) reasoning: Arc<ReasoningManager>,
    pub(crate) events: EventBus,
    pub(crate) keyed: KeyedSerializer,
    pub(crate) policy: FailurePolicy,
}

impl Pipeline {
    pub fn builder(config: AppConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// 订阅出站事件
    pub fn subscribe(&self) -> broadcast::Receiver<DealEvent> {
        self.events.subscribe()
    }

    /// 处理一条原始 JSON；解析失败记录后丢弃
    pub async fn handle_raw(&self, raw: &str) -> PipelineOutcome {
        match serde_json::from_str::<InquiryExtracted>(raw) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                self.policy
                    .handle("raw", &DealError::MalformedInput(format!("unparseable event: {}", e)));
                PipelineOutcome::default()
            }
        }
    }

    /// 处理一条 inquiry.extracted 事件
    pub async fn handle_event(&self, event: InquiryExtracted) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::default();
        let key = event
            .inquiry_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let _guard = match &key {
            Some(k) => Some(self.keyed.lock(k).await),
            None => None,
        };
        let scope = key.as_deref().unwrap_or("unknown");

        let ctx = match self.merger.merge(&event).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return outcome,
            Err(e) => {
                self.policy.handle(scope, &e);
                return outcome;
            }
        };
        outcome.context = Some(ctx.clone());
        let _deal_guard = self.lock_deal(&ctx).await;
        self.adopt_inquiry_state(&ctx);
        self.evaluate(&ctx, false, &mut outcome).await;
        outcome
    }

    /// 显式强制开启新一轮（唯一绕过指纹抑制的入口）
    pub async fn force_evaluation(&self, inquiry_id: &str) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::default();
        let _guard = self.keyed.lock(inquiry_id).await;
        let Some(ctx) = self.load_context(inquiry_id) else {
            return outcome;
        };
        outcome.context = Some(ctx.clone());
        let _deal_guard = self.lock_deal(&ctx).await;
        self.evaluate(&ctx, true, &mut outcome).await;
        outcome
    }

    /// 记录品牌方新报价并基于最新快照决策；不改变就绪轮次
    pub async fn record_brand_offer(&self, inquiry_id: &str, offer: f64, message: &str) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::default();
        let _guard = self.keyed.lock(inquiry_id).await;
        let Some(ctx) = self.load_context(inquiry_id) else {
            return outcome;
        };
        outcome.context = Some(ctx.clone());
        let _deal_guard = self.lock_deal(&ctx).await;
        let deal_key = ctx.deal_key().to_string();

        match self.reasoning.load(&deal_key) {
            Ok(rc) if rc.stage.is_terminal() => {
                tracing::warn!(
                    inquiry_id,
                    deal_key = %deal_key,
                    stage = rc.stage.as_str(),
                    "brand offer after deal settled, ignored"
                );
                return outcome;
            }
            Ok(_) => {}
            Err(e) => {
                self.policy.handle(inquiry_id, &e);
                return outcome;
            }
        }

        if let Err(e) = self.history.append(&deal_key, true, offer, message, None) {
            self.policy.handle(inquiry_id, &e);
            return outcome;
        }

        let snapshot = match self.snapshots.latest_snapshot(inquiry_id) {
            Ok(Some(s)) => s,
            Ok(None) => {
                tracing::warn!(inquiry_id, "brand offer recorded but no rate snapshot yet, decision deferred");
                return outcome;
            }
            Err(e) => {
                self.policy.handle(inquiry_id, &e);
                return outcome;
            }
        };
        outcome.decision = self.decide(&ctx, &snapshot).await;
        outcome.snapshot = Some(snapshot);
        outcome
    }

    /// 外部协作方发送消息后回执：标记决策已执行
    pub async fn mark_decision_executed(&self, inquiry_id: &str, decision_id: &str) -> bool {
        let _guard = self.keyed.lock(inquiry_id).await;
        let deal_key = self
            .load_context(inquiry_id)
            .map(|c| c.deal_key().to_string())
            .unwrap_or_else(|| inquiry_id.to_string());
        let _deal_guard = self.keyed.lock(&format!("deal:{}", deal_key)).await;
        match self.reasoning.mark_executed(&deal_key, decision_id) {
            Ok(marked) => marked,
            Err(e) => {
                self.policy.handle(inquiry_id, &e);
                false
            }
        }
    }

    pub async fn dispatch(&self, command: PipelineCommand) -> PipelineOutcome {
        match command {
            PipelineCommand::Extracted(event) => self.handle_event(event).await,
            PipelineCommand::Force { inquiry_id } => self.force_evaluation(&inquiry_id).await,
            PipelineCommand::Offer {
                inquiry_id,
                amount,
                message,
            } => self.record_brand_offer(&inquiry_id, amount, &message).await,
            PipelineCommand::Executed {
                inquiry_id,
                decision_id,
            } => {
                self.mark_decision_executed(&inquiry_id, &decision_id).await;
                PipelineOutcome::default()
            }
        }
    }

    /// 回收不活跃的推理上下文与空闲锁槽
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> usize {
        let pruned = self.keyed.prune();
        tracing::debug!(pruned, "idle inquiry locks pruned");
        match self.reasoning.collect_garbage(now, self.gc_inactive_days) {
            Ok(removed) => removed,
            Err(e) => {
                self.policy.handle("gc", &e);
                0
            }
        }
    }

    pub fn context(&self, inquiry_id: &str) -> Option<BrandContext> {
        self.merger.load(inquiry_id).ok().flatten()
    }

    pub fn readiness(&self, inquiry_id: &str) -> Option<ReadinessRecord> {
        self.gate.record(inquiry_id).ok().flatten()
    }

    pub fn latest_snapshot(&self, inquiry_id: &str) -> Option<RateSnapshot> {
        self.snapshots.latest_snapshot(inquiry_id).ok().flatten()
    }

    pub fn snapshot_for_round(&self, inquiry_id: &str, round: u32) -> Option<RateSnapshot> {
        self.snapshots.snapshot_for_round(inquiry_id, round).ok().flatten()
    }

    pub fn history(&self, inquiry_id: &str) -> Vec<NegotiationRound> {
        let deal_key = self
            .context(inquiry_id)
            .map(|c| c.deal_key().to_string())
            .unwrap_or_else(|| inquiry_id.to_string());
        self.history.load(&deal_key).unwrap_or_default()
    }

    /// 推理上下文审计导出
    pub fn export_reasoning(&self, inquiry_id: &str) -> Option<serde_json::Value> {
        let deal_key = self
            .context(inquiry_id)
            .map(|c| c.deal_key().to_string())
            .unwrap_or_else(|| inquiry_id.to_string());
        self.reasoning.export(&deal_key).ok()
    }

    async fn lock_deal(&self, ctx: &BrandContext) -> OwnedMutexGuard<()> {
        self.keyed.lock(&format!("deal:{}", ctx.deal_key())).await
    }

    /// inquiry 关联到 deal 后，把仍以 inquiryId 记录的谈判历史与推理上下文并入 deal
    fn adopt_inquiry_state(&self, ctx: &BrandContext) {
        let Some(deal_id) = ctx.deal_id.as_deref() else {
            return;
        };
        let scope = ctx.inquiry_id.as_str();
        if let Err(e) = self.history.adopt(scope, deal_id) {
            self.policy.handle(scope, &e);
        }
        if let Err(e) = self.reasoning.adopt(scope, deal_id) {
            self.policy.handle(scope, &e);
        }
    }

    fn load_context(&self, inquiry_id: &str) -> Option<BrandContext> {
        match self.merger.load(inquiry_id) {
            Ok(Some(ctx)) => Some(ctx),
            Ok(None) => {
                self.policy.handle(
                    inquiry_id,
                    &DealError::MalformedInput(format!("unknown inquiry {}", inquiry_id)),
                );
                None
            }
            Err(e) => {
                self.policy.handle(inquiry_id, &e);
                None
            }
        }
    }

    /// 就绪评估；触发时生成快照并视配置自动决策
    async fn evaluate(&self, ctx: &BrandContext, force: bool, outcome: &mut PipelineOutcome) {
        let scope = ctx.inquiry_id.as_str();
        let result = if force {
            self.gate.force(ctx)
        } else {
            self.gate.evaluate(ctx)
        };
        let readiness = match result {
            Ok(r) => r,
            Err(e) => {
                self.policy.handle(scope, &e);
                return;
            }
        };
        outcome.readiness = Some(readiness.clone());
        if !readiness.triggered {
            return;
        }

        self.events.emit(DealEvent::EvaluationRequested {
            inquiry_id: ctx.inquiry_id.clone(),
            deal_id: ctx.deal_id.clone(),
            creator_id: ctx.creator_id.clone(),
            round: readiness.round,
            signature: readiness.signature.clone(),
            forced: readiness.forced,
        });

        let snapshot = match self
            .snapshots
            .produce_snapshot(&ctx.inquiry_id, ctx.deal_id.as_deref(), &ctx.creator_id, readiness.round)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.policy.handle(scope, &e);
                return;
            }
        };
        outcome.snapshot = Some(snapshot.clone());

        if !self.negotiation.auto_decide_on_snapshot {
            return;
        }
        if snapshot.status == SnapshotStatus::CalculatorFailed {
            tracing::warn!(
                inquiry_id = scope,
                round = readiness.round,
                "rate snapshot degraded, round stalled until retry or force"
            );
            return;
        }
        let Some(budget) = ctx.proposed_budget else {
            return;
        };
        // 已在接受区间内的预算只作为上下文，等品牌正式报价再决策
        if let Some(market) = snapshot.market_rate() {
            if budget >= self.negotiation.accept_threshold * market {
                tracing::info!(
                    inquiry_id = scope,
                    budget,
                    market_rate = market,
                    "stated budget already acceptable, held until the brand makes an offer"
                );
                return;
            }
        }

        // 需要回应的开场预算视为品牌首轮报价；之后仅当预算变化时视为新报价
        let deal_key = ctx.deal_key().to_string();
        let history = match self.history.load(&deal_key) {
            Ok(h) => h,
            Err(e) => {
                self.policy.handle(scope, &e);
                return;
            }
        };
        let is_new_offer = match latest_brand_offer(&history) {
            None => true,
            Some(last) => (last - budget).abs() > f64::EPSILON,
        };
        if !is_new_offer {
            tracing::debug!(inquiry_id = scope, "budget unchanged since last brand offer, awaiting brand");
            return;
        }
        match self.reasoning.load(&deal_key) {
            Ok(rc) if rc.stage.is_terminal() => {
                tracing::warn!(inquiry_id = scope, stage = rc.stage.as_str(), "deal already settled, budget change ignored");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                self.policy.handle(scope, &e);
                return;
            }
        }
        let note = if history.is_empty() {
            "opening budget from inquiry"
        } else {
            "revised budget from inquiry"
        };
        if let Err(e) = self.history.append(&deal_key, true, budget, note, None) {
            self.policy.handle(scope, &e);
            return;
        }
        outcome.decision = self.decide(ctx, &snapshot).await;
    }

    /// 决策、记录我方回应并发出事件
    async fn decide(&self, ctx: &BrandContext, snapshot: &RateSnapshot) -> Option<RecordedDecision> {
        let scope = ctx.inquiry_id.as_str();
        let deal_key = ctx.deal_key().to_string();
        let history = match self.history.load(&deal_key) {
            Ok(h) => h,
            Err(e) => {
                self.policy.handle(scope, &e);
                return None;
            }
        };

        let recorded = match self.engine.decide_and_record(ctx, Some(snapshot), &history).await {
            Ok(Some(r)) => r,
            Ok(None) => return None,
            Err(e) => {
                self.policy.handle(scope, &e);
                return None;
            }
        };

        if let Some(amount) = recorded.decision.action.amount() {
            if let Err(e) = self.history.append(
                &deal_key,
                false,
                amount,
                &recorded.decision.message,
                Some(recorded.decision.reasoning.clone()),
            ) {
                self.policy.handle(scope, &e);
            }
        }

        self.events.emit(DealEvent::NegotiationDecided {
            inquiry_id: ctx.inquiry_id.clone(),
            deal_key,
            decision_id: recorded.decision_id.clone(),
            round: snapshot.negotiation_round,
            decision: recorded.decision.clone(),
        });
        Some(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let cmd: PipelineCommand = serde_json::from_str(
            r#"{"type": "offer", "inquiryId": "INQ-1", "amount": 15000, "message": "best we can do"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, PipelineCommand::Offer { amount, .. } if amount == 15000.0));

        let cmd: PipelineCommand = serde_json::from_str(
            r#"{"type": "extracted", "inquiryId": "INQ-1", "source": "email", "extracted": {}}"#,
        )
        .unwrap();
        match cmd {
            PipelineCommand::Extracted(e) => assert_eq!(e.inquiry_id.as_deref(), Some("INQ-1")),
            other => panic!("unexpected command {:?}", other),
        }

        let cmd: PipelineCommand =
            serde_json::from_str(r#"{"type": "executed", "inquiryId": "INQ-1", "decisionId": "dec_1"}"#).unwrap();
        assert!(matches!(cmd, PipelineCommand::Executed { .. }));
    }
}
