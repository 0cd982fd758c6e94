//! 引擎错误类型与错误分类
//!
//! 与 FailurePolicy 配合：根据 DealError 的分类决定丢弃 / 降级 / 跳过写入 / 启动失败。

use thiserror::Error;

/// 谈判编排过程中可能出现的错误（输入缺失、外部依赖、状态冲突、配置、存储）
#[derive(Error, Debug)]
pub enum DealError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Rate calculator failed: {0}")]
    CalculatorFailed(String),

    #[error("Metrics provider failed: {0}")]
    MetricsUnavailable(String),

    #[error("Strategic advisor failed: {0}")]
    AdvisorFailed(String),

    #[error("Deal directory lookup failed: {0}")]
    DirectoryFailed(String),

    #[error("External call timed out after {secs}s: {target}")]
    Timeout { target: String, secs: u64 },

    #[error("Snapshot for inquiry {inquiry_id} round {round} already exists or is stale")]
    SnapshotConflict { inquiry_id: String, round: u32 },

    #[error("Concurrent write lost for {namespace}/{key}")]
    WriteConflict { namespace: String, key: String },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for DealError {
    fn from(e: rusqlite::Error) -> Self {
        DealError::Storage(e.to_string())
    }
}

/// 错误分类（对应四类失败语义 + 存储故障）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 输入缺字段 / 无法解析：记录后丢弃
    MalformedInput,
    /// 外部依赖失败：降级但仍持久化
    ExternalDependency,
    /// 重复轮次 / 过期写入：跳过写入并告警
    StateConflict,
    /// 结构性配置错误：启动时失败
    Configuration,
    /// 存储后端故障：本轮停滞，等待重试或强制触发
    Storage,
}

impl DealError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DealError::MalformedInput(_) | DealError::Serialization(_) => ErrorKind::MalformedInput,
            DealError::CalculatorFailed(_)
            | DealError::MetricsUnavailable(_)
            | DealError::AdvisorFailed(_)
            | DealError::DirectoryFailed(_)
            | DealError::Timeout { .. } => ErrorKind::ExternalDependency,
            DealError::SnapshotConflict { .. } | DealError::WriteConflict { .. } => {
                ErrorKind::StateConflict
            }
            DealError::ConfigError(_) => ErrorKind::Configuration,
            DealError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// FailurePolicy 根据错误分类给出的处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// 记录告警后丢弃当前事件（上游负责重投）
    Drop,
    /// 降级继续：写入 calculator_failed 快照或走确定性规则
    Degrade,
    /// 跳过本次写入与事件发射，保留已有审计记录
    SkipWrite,
    /// 启动阶段直接失败
    FailFast,
    /// 本轮停滞，等待重试 / force
    Stall,
}
