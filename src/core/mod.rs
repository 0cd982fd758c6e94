//! 核心层：错误与失败策略、出站事件、按 key 串行化、编排主流程、优雅关闭

pub mod builder;
pub mod error;
pub mod events;
pub mod keyed;
pub mod pipeline;
pub mod recovery;
pub mod shutdown;

pub use builder::PipelineBuilder;
pub use error::{DealError, ErrorKind, FailureAction};
pub use events::{DealEvent, EventBus};
pub use keyed::KeyedSerializer;
pub use pipeline::{Pipeline, PipelineCommand, PipelineOutcome};
pub use recovery::FailurePolicy;
pub use shutdown::{ShutdownManager, ShutdownReason};
