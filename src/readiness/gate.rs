//! 就绪门控
//!
//! 对每次合并后的上下文计算指纹并判断是否就绪；仅当「就绪 且 指纹与上次触发时不同」才触发下游报价评估，
//! 同时轮次 +1。重复投递同一上下文只会命中指纹相等而被抑制。
//! `force` 是唯一绕过指纹抑制的入口，必须显式调用。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::BrandContext;
use crate::core::DealError;
use crate::readiness::{context_fingerprint, is_negotiation_ready};
use crate::store::{KvStore, Namespace};

/// 每个 inquiry 一条就绪记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessRecord {
    pub inquiry_id: String,
    /// 上次触发时的指纹
    pub last_signature: Option<String>,
    pub negotiation_round: u32,
    pub is_ready: bool,
    pub last_evaluated_at: DateTime<Utc>,
}

/// 一次评估的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessOutcome {
    pub is_ready: bool,
    pub round: u32,
    pub triggered: bool,
    pub forced: bool,
    pub signature: String,
}

pub struct ReadinessGate {
    store: Arc<dyn KvStore>,
}

impl ReadinessGate {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, inquiry_id: &str) -> Result<Option<ReadinessRecord>, DealError> {
        crate::store::get_json(self.store.as_ref(), Namespace::Readiness, inquiry_id)
    }

    /// 常规评估：指纹相同不触发
    pub fn evaluate(&self, ctx: &BrandContext) -> Result<ReadinessOutcome, DealError> {
        self.run(ctx, false)
    }

    /// 强制开启新一轮（仍要求上下文就绪）
    pub fn force(&self, ctx: &BrandContext) -> Result<ReadinessOutcome, DealError> {
        self.run(ctx, true)
    }

    fn run(&self, ctx: &BrandContext, force: bool) -> Result<ReadinessOutcome, DealError> {
        let raw_prior = self.store.get(Namespace::Readiness, &ctx.inquiry_id)?;
        let prior: Option<ReadinessRecord> = match &raw_prior {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };

        let is_ready = is_negotiation_ready(ctx);
        let signature = context_fingerprint(ctx);
        let last_signature = prior.as_ref().and_then(|p| p.last_signature.clone());
        let prior_round = prior.as_ref().map(|p| p.negotiation_round).unwrap_or(0);

        let triggered = is_ready && (force || last_signature.as_deref() != Some(signature.as_str()));
        if force && !is_ready {
            tracing::warn!(inquiry_id = %ctx.inquiry_id, "force requested but context is not negotiation-ready");
        }

        let round = if triggered { prior_round + 1 } else { prior_round };
        let record = ReadinessRecord {
            inquiry_id: ctx.inquiry_id.clone(),
            last_signature: if triggered { Some(signature.clone()) } else { last_signature },
            negotiation_round: round,
            is_ready,
            last_evaluated_at: Utc::now(),
        };

        let raw = serde_json::to_string(&record)?;
        let written = self.store.compare_and_swap(
            Namespace::Readiness,
            &ctx.inquiry_id,
            raw_prior.as_deref(),
            &raw,
        )?;
        if !written {
            return Err(DealError::WriteConflict {
                namespace: Namespace::Readiness.as_str().to_string(),
                key: ctx.inquiry_id.clone(),
            });
        }

        if triggered {
            tracing::info!(inquiry_id = %ctx.inquiry_id, round, forced = force, "readiness triggered");
        } else {
            tracing::debug!(inquiry_id = %ctx.inquiry_id, is_ready, round, "readiness unchanged");
        }

        Ok(ReadinessOutcome {
            is_ready,
            round,
            triggered,
            forced: force && triggered,
            signature,
        })
    }
}
