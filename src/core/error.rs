//! 编排错误类型
//!
//! 只有 WorkerError（见 workers::registry）会让状态机进入 error 分支并触发 ErrorResolver；
//! 这里的错误要么终止运行（failed），要么只出现在构建阶段。

use thiserror::Error;

/// 命令语言解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// 需要引号文件名 / 模板名的命令缺少该参数
    #[error("Malformed command '{command}': {reason}")]
    MalformedCommand { command: String, reason: String },
}

/// Orchestrator 层面的错误：一旦出现即把运行标记为 failed，不经过 Resolver
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Planner 没有产出可用计划
    #[error("Planning failed: {0}")]
    PlanningFailure(String),

    /// 子任务缺少 agent 或 description
    #[error("Malformed subtask received.")]
    MalformedSubtask,

    #[error(transparent)]
    MalformedCommand(#[from] CommandError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),
}
