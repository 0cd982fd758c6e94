//! Dealflow - 创作者品牌合作谈判编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与启动校验
//! - **context**: 入站抽取事件、品牌上下文合并、线程与 Deal 关联
//! - **core**: 错误与失败策略、出站事件、按 inquiry 串行化、编排主流程、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **negotiation**: 谈判历史、策略顾问、决策引擎
//! - **observability**: 日志初始化
//! - **rate**: 创作者指标缓存、报价计算协作方、按轮次不可变的报价快照
//! - **readiness**: 上下文指纹与就绪门控
//! - **reasoning**: 按 deal 累积的推理上下文（事件日志 + 投影）
//! - **store**: KV 存储抽象（内存 / SQLite）

pub mod config;
pub mod context;
pub mod core;
pub mod llm;
pub mod negotiation;
pub mod observability;
pub mod rate;
pub mod readiness;
pub mod reasoning;
pub mod store;

pub use crate::core::{DealError, DealEvent, Pipeline, PipelineCommand};
