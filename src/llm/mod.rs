//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek），以及测试用的脚本化 Mock

pub mod deepseek;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::AdvisorSection;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::LlmClient;

/// 按 [advisor] 段创建 LLM 客户端（provider 已由 `AppConfig::validate` 限定为 deepseek / openai）
pub fn create_llm_from_config(cfg: &AdvisorSection) -> Arc<dyn LlmClient> {
    match cfg.provider.as_str() {
        "deepseek" => Arc::new(create_deepseek_client(
            cfg.model.as_deref(),
            cfg.base_url.as_deref(),
        )),
        _ => Arc::new(OpenAiClient::new(
            cfg.base_url.as_deref(),
            cfg.model.as_deref().unwrap_or("gpt-4o-mini"),
            None,
        )),
    }
}
