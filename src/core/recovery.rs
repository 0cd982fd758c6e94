//! 失败处理策略
//!
//! 根据 DealError 分类返回 FailureAction，并以统一格式记录日志；
//! Pipeline 依据动作决定丢弃事件、降级、跳过写入还是让本轮停滞。

use crate::core::{DealError, ErrorKind, FailureAction};

/// 将错误映射为可执行动作（丢弃 / 降级 / 跳过写入 / 启动失败 / 停滞）
#[derive(Debug, Default)]
pub struct FailurePolicy;

impl FailurePolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn action_for(&self, err: &DealError) -> FailureAction {
        match err.kind() {
            ErrorKind::MalformedInput => FailureAction::Drop,
            ErrorKind::ExternalDependency => FailureAction::Degrade,
            ErrorKind::StateConflict => FailureAction::SkipWrite,
            ErrorKind::Configuration => FailureAction::FailFast,
            ErrorKind::Storage => FailureAction::Stall,
        }
    }

    /// 记录错误并返回动作；scope 一般是 inquiry_id 或 deal key
    pub fn handle(&self, scope: &str, err: &DealError) -> FailureAction {
        let action = self.action_for(err);
        match action {
            FailureAction::Drop => {
                tracing::warn!(scope, error = %err, "dropping event");
            }
            FailureAction::Degrade => {
                tracing::warn!(scope, error = %err, "external dependency degraded");
            }
            FailureAction::SkipWrite => {
                tracing::warn!(scope, error = %err, "state conflict, write skipped");
            }
            FailureAction::FailFast => {
                tracing::error!(scope, error = %err, "structural configuration error");
            }
            FailureAction::Stall => {
                tracing::error!(scope, error = %err, "storage failure, round stalled until retry");
            }
        }
        action
    }
}
