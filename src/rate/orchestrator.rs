//! 报价快照编排
//!
//! 就绪门控触发后：组装品牌信息 → 取创作者指标（TTL 缓存，未命中时按顺序询问指标源）→ 调用报价计算器 →
//! 以 (inquiryId, round) 原子占位后写入不可变快照，并发出 `rate.recommendation_generated`。
//! 外部调用一律带超时；任何外部失败都落为 calculator_failed 快照，不向上抛出。
//! 只有状态冲突（该轮已存在 / 轮次不大于已有最新轮）会返回错误，此时不写入也不发事件。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout;

use crate::config::RateSection;
use crate::context::{BrandContext, DealDirectory};
use crate::core::{DealError, DealEvent, EventBus};
use crate::rate::{
    BrandDetails, CreatorMetrics, MetricsCache, MetricsProvider, RateCalculator, RateComputation,
    RateSnapshot, SnapshotStatus,
};
use crate::store::{get_json, KvStore, Namespace};

const UNKNOWN_BRAND: &str = "Unknown Brand";

pub struct SnapshotOrchestrator {
    store: Arc<dyn KvStore>,
    directory: Arc<dyn DealDirectory>,
    providers: Vec<Arc<dyn MetricsProvider>>,
    calculator: Arc<dyn RateCalculator>,
    cache: MetricsCache,
    events: EventBus,
    calculator_timeout: Duration,
    metrics_timeout: Duration,
}

impl SnapshotOrchestrator {
    pub fn new(
        store: Arc<dyn KvStore>,
        directory: Arc<dyn DealDirectory>,
        calculator: Arc<dyn RateCalculator>,
        events: EventBus,
        cfg: &RateSection,
    ) -> Self {
        Self {
            store,
            directory,
            providers: Vec::new(),
            calculator,
            cache: MetricsCache::new(Duration::from_secs(cfg.metrics_cache_ttl_secs)),
            events,
            calculator_timeout: Duration::from_secs(cfg.calculator_timeout_secs),
            metrics_timeout: Duration::from_secs(cfg.metrics_timeout_secs),
        }
    }

    /// 追加一个指标源（按添加顺序询问，第一个成功者生效）
    pub fn with_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn metrics_cache(&self) -> &MetricsCache {
        &self.cache
    }

    /// 为指定轮次生成快照
    ///
    /// 调用方需保证同一 inquiry 串行调用。
    pub async fn produce_snapshot(
        &self,
        inquiry_id: &str,
        deal_id: Option<&str>,
        creator_id: &str,
        round: u32,
    ) -> Result<RateSnapshot, DealError> {
        let ctx: BrandContext = get_json(self.store.as_ref(), Namespace::BrandContexts, inquiry_id)?
            .ok_or_else(|| {
                DealError::MalformedInput(format!("no brand context for inquiry {}", inquiry_id))
            })?;

        // 先做一次轮次检查，避免对注定冲突的轮次发起外部调用
        self.ensure_after_latest(inquiry_id, round)?;

        let brand_name = self.resolve_brand_name(&ctx, deal_id).await;
        let brand = BrandDetails::from_context(&ctx, brand_name);

        let (metrics, computation) = match self.creator_metrics(creator_id, &brand).await {
            Ok(metrics) => {
                let computation = self.compute(inquiry_id, &brand, &metrics).await;
                (Some(metrics), computation)
            }
            Err(e) => (None, Err(e)),
        };

        let (status, payload, error) = match computation {
            Ok(payload) => (SnapshotStatus::Success, Some(payload), None),
            Err(e) => {
                tracing::warn!(inquiry_id, round, error = %e, "rate computation degraded");
                (SnapshotStatus::CalculatorFailed, None, Some(e.to_string()))
            }
        };

        let snapshot = RateSnapshot {
            recommendation_id: recommendation_id(inquiry_id, round),
            inquiry_id: inquiry_id.to_string(),
            deal_id: deal_id.map(str::to_string).or_else(|| ctx.deal_id.clone()),
            negotiation_round: round,
            status,
            brand_details: brand,
            creator_metrics: metrics,
            payload,
            error,
            created_at: Utc::now(),
        };

        self.persist(&snapshot)?;
        tracing::info!(
            inquiry_id,
            round,
            recommendation_id = %snapshot.recommendation_id,
            status = ?snapshot.status,
            "rate snapshot stored"
        );
        self.events.emit(DealEvent::RecommendationGenerated {
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, recommendation_id: &str) -> Result<Option<RateSnapshot>, DealError> {
        get_json(self.store.as_ref(), Namespace::RateSnapshots, recommendation_id)
    }

    pub fn snapshot_for_round(
        &self,
        inquiry_id: &str,
        round: u32,
    ) -> Result<Option<RateSnapshot>, DealError> {
        match self.store.get(Namespace::SnapshotRounds, &round_key(inquiry_id, round))? {
            Some(recommendation_id) => self.get_snapshot(&recommendation_id),
            None => Ok(None),
        }
    }

    pub fn latest_snapshot(&self, inquiry_id: &str) -> Result<Option<RateSnapshot>, DealError> {
        match self.latest_round(inquiry_id)? {
            Some(round) => self.snapshot_for_round(inquiry_id, round),
            None => Ok(None),
        }
    }

    /// 该 inquiry 已写入的最大轮次
    pub fn latest_round(&self, inquiry_id: &str) -> Result<Option<u32>, DealError> {
        let prefix = format!("{}#", inquiry_id);
        let rounds = self.store.scan_prefix(Namespace::SnapshotRounds, &prefix)?;
        Ok(rounds
            .iter()
            .filter_map(|(key, _)| key.strip_prefix(&prefix)?.parse::<u32>().ok())
            .max())
    }

    fn ensure_after_latest(&self, inquiry_id: &str, round: u32) -> Result<(), DealError> {
        match self.latest_round(inquiry_id)? {
            Some(latest) if round <= latest => Err(DealError::SnapshotConflict {
                inquiry_id: inquiry_id.to_string(),
                round,
            }),
            _ => Ok(()),
        }
    }

    /// 先占位 (inquiryId, round) 再写快照本体；占位失败即冲突，绝不覆盖
    fn persist(&self, snapshot: &RateSnapshot) -> Result<(), DealError> {
        let conflict = || DealError::SnapshotConflict {
            inquiry_id: snapshot.inquiry_id.clone(),
            round: snapshot.negotiation_round,
        };
        self.ensure_after_latest(&snapshot.inquiry_id, snapshot.negotiation_round)?;
        let claimed = self.store.insert_new(
            Namespace::SnapshotRounds,
            &round_key(&snapshot.inquiry_id, snapshot.negotiation_round),
            &snapshot.recommendation_id,
        )?;
        if !claimed {
            return Err(conflict());
        }
        let raw = serde_json::to_string(snapshot)?;
        if !self
            .store
            .insert_new(Namespace::RateSnapshots, &snapshot.recommendation_id, &raw)?
        {
            return Err(conflict());
        }
        Ok(())
    }

    /// 品牌名兜底顺序：上下文 → 关联 Deal → 原始询价发件人 → "Unknown Brand"
    async fn resolve_brand_name(&self, ctx: &BrandContext, deal_id: Option<&str>) -> String {
        if let Some(name) = ctx.brand_name.as_deref().filter(|s| !s.trim().is_empty()) {
            return name.to_string();
        }
        if let Some(deal_id) = deal_id.or(ctx.deal_id.as_deref()) {
            match self.directory.get(deal_id).await {
                Ok(Some(deal)) => {
                    if let Some(name) = deal.brand_name.filter(|s| !s.trim().is_empty()) {
                        return name;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(deal_id, error = %e, "deal lookup for brand name failed"),
            }
        }
        ctx.counterpart_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_BRAND.to_string())
    }

    async fn creator_metrics(
        &self,
        creator_id: &str,
        brand: &BrandDetails,
    ) -> Result<CreatorMetrics, DealError> {
        if let Some(hit) = self.cache.get(creator_id) {
            tracing::debug!(creator_id, "metrics cache hit");
            return Ok(hit);
        }

        let mut last_err = DealError::MetricsUnavailable("no metrics provider configured".to_string());
        for provider in &self.providers {
            let start = Instant::now();
            let result = bounded(
                "metrics_provider",
                self.metrics_timeout,
                provider.fetch(creator_id, brand.platform.as_deref()),
            )
            .await;
            audit("metrics_provider", provider.name(), creator_id, start, &result);
            match result {
                Ok(metrics) => {
                    let metrics = metrics.reconcile_with(brand);
                    self.cache.put(creator_id, metrics.clone());
                    return Ok(metrics);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn compute(
        &self,
        inquiry_id: &str,
        brand: &BrandDetails,
        metrics: &CreatorMetrics,
    ) -> Result<RateComputation, DealError> {
        let start = Instant::now();
        let result = bounded(
            "rate_calculator",
            self.calculator_timeout,
            self.calculator.compute(brand, metrics),
        )
        .await;
        audit("rate_calculator", "calculator", inquiry_id, start, &result);
        result
    }
}

/// 对外部调用施加超时，超时转为 DealError::Timeout
async fn bounded<T>(
    target: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, DealError>>,
) -> Result<T, DealError> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DealError::Timeout {
            target: target.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

/// 每次外部调用输出一行 JSON 审计日志
fn audit<T>(target: &str, provider: &str, scope: &str, start: Instant, result: &Result<T, DealError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(DealError::Timeout { .. }) => "timeout",
        Err(_) => "error",
    };
    let audit = serde_json::json!({
        "event": "external_call_audit",
        "target": target,
        "provider": provider,
        "scope": scope,
        "ok": result.is_ok(),
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit, "external call");
}

fn round_key(inquiry_id: &str, round: u32) -> String {
    format!("{}#{:03}", inquiry_id, round)
}

/// rec_{inquiryId}_{round:03}_{millis}_{nonce}：同一轮重试也不会撞 id
pub fn recommendation_id(inquiry_id: &str, round: u32) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "rec_{}_{:03}_{}_{}",
        inquiry_id,
        round,
        Utc::now().timestamp_millis(),
        &nonce[..8]
    )
}
