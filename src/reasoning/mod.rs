//! 推理上下文（按 deal 累积推理、决策与自我修正，跨多日生命周期）

pub mod manager;
pub mod types;

pub use manager::ReasoningManager;
pub use types::{
    CorrectionEntry, DealStage, DecisionEntry, ReasoningContext, ReasoningEntry, ReasoningEvent,
    ReasoningLog, ThoughtEntry,
};
