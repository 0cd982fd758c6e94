//! 报价快照相关的数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{BrandContext, Deliverable};

/// 创作者数据指标（来自外部指标源）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorMetrics {
    pub followers: u64,
    pub engagement_rate: f64,
    #[serde(default)]
    pub avg_views: Option<u64>,
    /// 每周发布条数
    #[serde(default)]
    pub posting_frequency: Option<f64>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl CreatorMetrics {
    /// 指标源未给出平台/内容形式时，用品牌声明的补齐
    pub fn reconcile_with(mut self, brand: &BrandDetails) -> Self {
        if self.platform.is_none() {
            self.platform = brand.platform.clone();
        }
        if self.content_type.is_none() {
            self.content_type = brand.content_type.clone();
        }
        self
    }
}

/// 发给报价计算方的品牌侧信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrandDetails {
    pub brand_name: String,
    /// 例如 "1x Instagram Reel (launch teaser), 2x YouTube Video"
    pub deliverables_summary: String,
    pub budget: Option<f64>,
    pub currency: String,
    pub platform: Option<String>,
    pub content_type: Option<String>,
    pub timeline: Option<String>,
    pub urgency: Option<String>,
}

impl BrandDetails {
    pub fn from_context(ctx: &BrandContext, brand_name: String) -> Self {
        Self {
            brand_name,
            deliverables_summary: format_deliverables(&ctx.deliverables),
            budget: ctx.proposed_budget,
            currency: ctx.currency.clone(),
            platform: ctx.platform.clone(),
            content_type: ctx.content_type.clone(),
            timeline: ctx.timeline.clone(),
            urgency: ctx.urgency.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    #[serde(default)]
    pub average_rate: Option<f64>,
    #[serde(default)]
    pub min_rate: Option<f64>,
    #[serde(default)]
    pub max_rate: Option<f64>,
    #[serde(default)]
    pub sample_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRecommendation {
    pub recommended_rate: f64,
    #[serde(default)]
    pub min_acceptable: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// 报价计算方的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateComputation {
    pub baseline_rate: f64,
    pub engagement_adjusted_rate: f64,
    pub reach_adjusted_rate: f64,
    #[serde(default)]
    pub market_data: Option<MarketData>,
    pub recommendation: RateRecommendation,
}

impl RateComputation {
    /// 市场档位价：优先市场均价，否则取推荐价；非正数视为不可用
    pub fn market_rate(&self) -> Option<f64> {
        self.market_data
            .as_ref()
            .and_then(|m| m.average_rate)
            .filter(|r| *r > 0.0)
            .or_else(|| Some(self.recommendation.recommended_rate).filter(|r| *r > 0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Success,
    CalculatorFailed,
}

/// 每轮一份、写入后不可变的报价快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSnapshot {
    pub recommendation_id: String,
    pub inquiry_id: String,
    pub deal_id: Option<String>,
    pub negotiation_round: u32,
    pub status: SnapshotStatus,
    pub brand_details: BrandDetails,
    pub creator_metrics: Option<CreatorMetrics>,
    pub payload: Option<RateComputation>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RateSnapshot {
    pub fn market_rate(&self) -> Option<f64> {
        match self.status {
            SnapshotStatus::Success => self.payload.as_ref().and_then(|p| p.market_rate()),
            SnapshotStatus::CalculatorFailed => None,
        }
    }
}

/// "1x Instagram Reel (desc), 2x YouTube Video"
pub fn format_deliverables(deliverables: &[Deliverable]) -> String {
    deliverables
        .iter()
        .map(|d| {
            let label = title_case(&d.kind.replace(['_', '-'], " "));
            match d.description.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(desc) => format!("{}x {} ({})", d.count, label, desc),
                None => format!("{}x {}", d.count, label),
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            match lower.as_str() {
                "youtube" => "YouTube".to_string(),
                "tiktok" => "TikTok".to_string(),
                "linkedin" => "LinkedIn".to_string(),
                _ => {
                    let mut chars = lower.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                }
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
