//! 外部协作方：创作者指标源、报价计算器
//!
//! 业务层只依赖 trait；HTTP 实现基于 reqwest，非 2xx / 网络错误 / 响应体不合法都转为 DealError。
//! 超时由编排器统一施加，这里不重复设置。

use async_trait::async_trait;
use serde::Serialize;

use crate::core::DealError;
use crate::rate::{BrandDetails, CreatorMetrics, RateComputation};

/// 创作者指标源
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, creator_id: &str, platform: Option<&str>) -> Result<CreatorMetrics, DealError>;
}

/// 报价计算器：{brandDetails, creatorMetrics} → 各档报价 + 市场数据 + 推荐
#[async_trait]
pub trait RateCalculator: Send + Sync {
    async fn compute(
        &self,
        brand: &BrandDetails,
        metrics: &CreatorMetrics,
    ) -> Result<RateComputation, DealError>;
}

/// GET {base_url}/creators/{creator_id}/metrics[?platform=..]
pub struct HttpMetricsProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetricsProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetricsProvider for HttpMetricsProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, creator_id: &str, platform: Option<&str>) -> Result<CreatorMetrics, DealError> {
        let url = format!("{}/creators/{}/metrics", self.base_url, creator_id);
        let mut req = self.client.get(&url);
        if let Some(p) = platform {
            req = req.query(&[("platform", p)]);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DealError::MetricsUnavailable(format!("request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(DealError::MetricsUnavailable(format!("HTTP {}", resp.status())));
        }
        resp.json::<CreatorMetrics>()
            .await
            .map_err(|e| DealError::MetricsUnavailable(format!("bad body: {}", e)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CalculatorRequest<'a> {
    brand_details: &'a BrandDetails,
    creator_metrics: &'a CreatorMetrics,
}

/// POST {url}，JSON 请求体 {brandDetails, creatorMetrics}
pub struct HttpRateCalculator {
    client: reqwest::Client,
    url: String,
}

impl HttpRateCalculator {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl RateCalculator for HttpRateCalculator {
    async fn compute(
        &self,
        brand: &BrandDetails,
        metrics: &CreatorMetrics,
    ) -> Result<RateComputation, DealError> {
        let body = CalculatorRequest {
            brand_details: brand,
            creator_metrics: metrics,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DealError::CalculatorFailed(format!("request failed: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DealError::CalculatorFailed(format!(
                "HTTP {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }
        resp.json::<RateComputation>()
            .await
            .map_err(|e| DealError::CalculatorFailed(format!("bad body: {}", e)))
    }
}

/// 未配置计算器端点时使用：每次都失败，快照落为 calculator_failed
pub struct UnconfiguredCalculator;

#[async_trait]
impl RateCalculator for UnconfiguredCalculator {
    async fn compute(&self, _: &BrandDetails, _: &CreatorMetrics) -> Result<RateComputation, DealError> {
        Err(DealError::CalculatorFailed(
            "no rate calculator endpoint configured".to_string(),
        ))
    }
}
