//! 报价快照：创作者指标（带缓存）、报价计算协作方、按轮次不可变的快照

pub mod cache;
pub mod orchestrator;
pub mod providers;
pub mod types;

pub use cache::MetricsCache;
pub use orchestrator::{recommendation_id, SnapshotOrchestrator};
pub use providers::{
    HttpMetricsProvider, HttpRateCalculator, MetricsProvider, RateCalculator, UnconfiguredCalculator,
};
pub use types::{
    format_deliverables, BrandDetails, CreatorMetrics, MarketData, RateComputation,
    RateRecommendation, RateSnapshot, SnapshotStatus,
};
