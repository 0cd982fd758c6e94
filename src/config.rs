//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DEALFLOW__*` 覆盖（双下划线表示嵌套，如 `DEALFLOW__NEGOTIATION__MAX_ROUNDS=4`）。
//! 阈值等结构性配置在启动时由 `validate` 校验，不合法直接失败，而不是在每次请求时才发现。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::DealError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub negotiation: NegotiationSection,
    pub rate: RateSection,
    pub advisor: AdvisorSection,
    pub reasoning: ReasoningSection,
}

/// [app] 段：默认创作者、存储位置、事件广播容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 入站事件未携带 creatorId 时使用
    pub default_creator_id: String,
    /// SQLite 文件路径；未设置时使用内存存储
    pub db_path: Option<PathBuf>,
    pub event_buffer: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_creator_id: "default-creator".to_string(),
            db_path: None,
            event_buffer: 256,
        }
    }
}

/// 轮次上限耗尽且未达成一致时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundCapPolicy {
    /// 交给人工
    Escalate,
    /// 接受迄今为止品牌方的最高报价
    AcceptBest,
}

/// [negotiation] 段：阈值（占市场价比例）、轮次上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NegotiationSection {
    /// 报价 >= 市场价 * accept_threshold 直接接受
    pub accept_threshold: f64,
    /// 中间带下限：[counter_floor, accept_threshold) 还价
    pub counter_floor: f64,
    /// 我方最多回应（还价）轮数
    pub max_rounds: u32,
    pub on_round_cap: RoundCapPolicy,
    /// 最后一轮且报价略低于下限时转人工而不是拒绝
    pub escalate_borderline_on_final: bool,
    /// 「略低于下限」的宽度（占市场价比例）
    pub borderline_margin: f64,
    /// 快照生成后是否立即以品牌预算作为首轮报价进行决策
    pub auto_decide_on_snapshot: bool,
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            accept_threshold: 0.80,
            counter_floor: 0.60,
            max_rounds: 3,
            on_round_cap: RoundCapPolicy::Escalate,
            escalate_borderline_on_final: true,
            borderline_margin: 0.10,
            auto_decide_on_snapshot: true,
        }
    }
}

/// [rate] 段：报价计算器与指标服务端点、超时、指标缓存 TTL
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateSection {
    pub calculator_url: Option<String>,
    pub calculator_timeout_secs: u64,
    pub metrics_url: Option<String>,
    pub metrics_timeout_secs: u64,
    pub metrics_cache_ttl_secs: u64,
}

impl Default for RateSection {
    fn default() -> Self {
        Self {
            calculator_url: None,
            calculator_timeout_secs: 20,
            metrics_url: None,
            metrics_timeout_secs: 10,
            metrics_cache_ttl_secs: 3600,
        }
    }
}

pub const ADVISOR_PROVIDERS: [&str; 2] = ["deepseek", "openai"];

/// [advisor] 段：可选的策略推理协作方（LLM）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisorSection {
    pub enabled: bool,
    /// deepseek / openai
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AdvisorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            timeout_secs: 15,
        }
    }
}

/// [reasoning] 段：推理上下文的不活跃回收
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningSection {
    pub gc_inactive_days: i64,
    pub gc_interval_secs: u64,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            gc_inactive_days: 30,
            gc_interval_secs: 3600,
        }
    }
}

impl AppConfig {
    /// 结构性校验：阈值区间、轮次、超时
    pub fn validate(&self) -> Result<(), DealError> {
        let n = &self.negotiation;
        if !(n.counter_floor > 0.0 && n.counter_floor < n.accept_threshold) {
            return Err(DealError::ConfigError(format!(
                "counter_floor ({}) must be in (0, accept_threshold={})",
                n.counter_floor, n.accept_threshold
            )));
        }
        if n.accept_threshold > 2.0 {
            return Err(DealError::ConfigError(format!(
                "accept_threshold ({}) is unreasonably high",
                n.accept_threshold
            )));
        }
        if n.max_rounds == 0 {
            return Err(DealError::ConfigError("max_rounds must be >= 1".to_string()));
        }
        if !(0.0..=n.counter_floor).contains(&n.borderline_margin) {
            return Err(DealError::ConfigError(format!(
                "borderline_margin ({}) must be in [0, counter_floor]",
                n.borderline_margin
            )));
        }
        let r = &self.rate;
        if r.calculator_timeout_secs == 0 || r.metrics_timeout_secs == 0 {
            return Err(DealError::ConfigError(
                "external call timeouts must be > 0".to_string(),
            ));
        }
        if self.advisor.enabled && !ADVISOR_PROVIDERS.contains(&self.advisor.provider.as_str()) {
            return Err(DealError::ConfigError(format!(
                "advisor.provider must be one of {:?}, got {:?}",
                ADVISOR_PROVIDERS, self.advisor.provider
            )));
        }
        if self.advisor.enabled && self.advisor.timeout_secs == 0 {
            return Err(DealError::ConfigError(
                "advisor.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.reasoning.gc_inactive_days <= 0 {
            return Err(DealError::ConfigError(
                "reasoning.gc_inactive_days must be > 0".to_string(),
            ));
        }
        if self.app.event_buffer == 0 {
            return Err(DealError::ConfigError("app.event_buffer must be > 0".to_string()));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 DEALFLOW__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DEALFLOW__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DEALFLOW")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
