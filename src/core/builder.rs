//! Pipeline 构建器：按配置装配存储、Deal 目录、外部协作方与顾问
//!
//! 未显式注入的组件按配置创建：有 db_path 用 SQLite，否则内存；有端点用 HTTP 实现，否则用占位实现
//! （报价计算失败 → calculator_failed 快照）。测试通过 with_* 注入 Mock。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::{ContextMerger, DealDirectory, InMemoryDealDirectory};
use crate::core::{DealError, EventBus, FailurePolicy, KeyedSerializer, Pipeline};
use crate::llm::create_llm_from_config;
use crate::negotiation::{DecisionEngine, LlmAdvisor, NegotiationHistory, StrategicAdvisor};
use crate::rate::{
    HttpMetricsProvider, HttpRateCalculator, MetricsProvider, RateCalculator, SnapshotOrchestrator,
    UnconfiguredCalculator,
};
use crate::readiness::ReadinessGate;
use crate::reasoning::ReasoningManager;
use crate::store::{create_store, KvStore};

pub struct PipelineBuilder {
    config: AppConfig,
    store: Option<Arc<dyn KvStore>>,
    directory: Option<Arc<dyn DealDirectory>>,
    calculator: Option<Arc<dyn RateCalculator>>,
    providers: Vec<Arc<dyn MetricsProvider>>,
    advisor: Option<Arc<dyn StrategicAdvisor>>,
}

impl PipelineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            directory: None,
            calculator: None,
            providers: Vec::new(),
            advisor: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn DealDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_calculator(mut self, calculator: Arc<dyn RateCalculator>) -> Self {
        self.calculator = Some(calculator);
        self
    }

    /// 追加指标源；注入任意一个后不再按配置创建 HTTP 指标源
    pub fn with_metrics_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn StrategicAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_store(&self) -> Arc<dyn KvStore> {
        match &self.store {
            Some(store) => Arc::clone(store),
            None => create_store(self.config.app.db_path.as_deref()),
        }
    }

    fn build_calculator(&self) -> Arc<dyn RateCalculator> {
        if let Some(c) = &self.calculator {
            return Arc::clone(c);
        }
        match &self.config.rate.calculator_url {
            Some(url) => Arc::new(HttpRateCalculator::new(url.clone())),
            None => {
                tracing::warn!("rate.calculator_url not set, every snapshot will be calculator_failed");
                Arc::new(UnconfiguredCalculator)
            }
        }
    }

    fn build_providers(&self) -> Vec<Arc<dyn MetricsProvider>> {
        if !self.providers.is_empty() {
            return self.providers.clone();
        }
        match &self.config.rate.metrics_url {
            Some(url) => vec![Arc::new(HttpMetricsProvider::new(url.clone()))],
            None => Vec::new(),
        }
    }

    fn build_advisor(&self) -> Option<Arc<dyn StrategicAdvisor>> {
        if let Some(a) = &self.advisor {
            return Some(Arc::clone(a));
        }
        if !self.config.advisor.enabled {
            return None;
        }
        let llm = create_llm_from_config(&self.config.advisor);
        Some(Arc::new(LlmAdvisor::new(llm)))
    }

    /// 校验配置并装配 Pipeline；配置不合法直接失败
    pub fn build(self) -> Result<Pipeline, DealError> {
        self.config.validate()?;
        let cfg = &self.config;

        let store = self.build_store();
        let directory = self
            .directory
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryDealDirectory::new()));
        let events = EventBus::new(cfg.app.event_buffer);

        let merger = ContextMerger::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            events.clone(),
            cfg.app.default_creator_id.clone(),
        );
        let gate = ReadinessGate::new(Arc::clone(&store));

        let mut snapshots = SnapshotOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            self.build_calculator(),
            events.clone(),
            &cfg.rate,
        );
        for provider in self.build_providers() {
            snapshots = snapshots.with_provider(provider);
        }

        let reasoning = Arc::new(ReasoningManager::new(Arc::clone(&store)));
        let mut engine = DecisionEngine::new(cfg.negotiation.clone(), Arc::clone(&reasoning));
        if let Some(advisor) = self.build_advisor() {
            engine = engine.with_advisor(advisor, cfg.advisor.timeout_secs);
        }

        tracing::info!(
            persistent = cfg.app.db_path.is_some(),
            advisor = cfg.advisor.enabled,
            max_rounds = cfg.negotiation.max_rounds,
            "pipeline assembled"
        );

        Ok(Pipeline {
            negotiation: cfg.negotiation.clone(),
            gc_inactive_days: cfg.reasoning.gc_inactive_days,
            merger,
            gate,
            snapshots,
            engine,
            history: NegotiationHistory::new(store),
            reasoning,
            events,
            keyed: KeyedSerializer::new(),
            policy: FailurePolicy::new(),
        })
    }
}
