//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置回复；回复用完后返回错误。可设置人为延迟以模拟超时。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    delay: Option<Duration>,
    /// 记录收到的最后一组消息，便于断言 prompt 内容
    last_prompt: Mutex<Vec<Message>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.push(Ok(reply.into()));
        self
    }

    pub fn with_error(self, err: impl Into<String>) -> Self {
        self.push(Err(err.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn last_prompt(&self) -> Vec<Message> {
        self.last_prompt.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn push(&self, reply: Result<String, String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = messages.to_vec();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .map_err(|_| "mock lock poisoned".to_string())?
            .pop_front()
            .unwrap_or_else(|| Err("mock has no scripted reply".to_string()))
    }
}
