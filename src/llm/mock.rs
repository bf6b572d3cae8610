//! Mock LLM 客户端（用于测试与无 API Key 时的本地运行）
//!
//! 按顺序返回预置回复；脚本耗尽后返回空字符串（上层视为「未产出计划」）。
//! 记录调用次数，测试可据此断言某条路径没有调用生成器。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// Mock 客户端：脚本化回复 + 调用计数
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定文本
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for r in responses {
            client.push_response(r);
        }
        client
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Ok(response.into()));
        }
    }

    /// 下一次调用返回错误（模拟网络 / 限流失败）
    pub fn push_error(&self, error: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(Err(error.into()));
        }
    }

    /// 已发生的 complete 调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用最后一条消息的内容
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let (Ok(mut prompts), Some(last)) = (self.prompts.lock(), messages.last()) {
            prompts.push(last.content.clone());
        }
        let next = self
            .responses
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front();
        next.unwrap_or_else(|| Ok(String::new()))
    }
}
