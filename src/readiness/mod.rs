//! 就绪门控：指纹、就绪谓词、按指纹去重的轮次触发

pub mod fingerprint;
pub mod gate;

pub use fingerprint::{context_fingerprint, is_negotiation_ready};
pub use gate::{ReadinessGate, ReadinessOutcome, ReadinessRecord};
