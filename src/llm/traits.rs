//! 生成器抽象
//!
//! Planner、ErrorResolver 与 Coder Worker 只依赖 LlmClient：输入一组消息，返回一段文本。
//! 返回的文本不可信，调用方必须自行解析与校验。

use async_trait::async_trait;

use crate::llm::Message;

/// LLM 客户端 trait：单次非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
