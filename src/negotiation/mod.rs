//! 谈判：决策类型、谈判历史、策略顾问、决策引擎

pub mod advisor;
pub mod engine;
pub mod history;
pub mod types;

pub use advisor::{
    parse_suggestion, suggestion_schema_json, AdvisorRequest, AdvisorSuggestion, LlmAdvisor,
    StrategicAdvisor,
};
pub use engine::{DecisionEngine, RecordedDecision};
pub use history::{best_brand_offer, latest_brand_offer, our_responses, NegotiationHistory};
pub use types::{Decision, DecisionAction, NegotiationRound};
