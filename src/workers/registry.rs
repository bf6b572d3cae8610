//! Worker 注册表
//!
//! 所有 Worker 实现 Worker trait（name / description / run），由 WorkerRegistry 按名注册与查找，
//! 在构建 Orchestrator 时显式注入（没有全局单例）。Worker 只读 SharedState，结果通过 WorkerOutput 返回，
//! 由 Orchestrator 写回状态。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{Command, SharedState};

/// Worker 成功时的结果；Orchestrator 只读取这些字段
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    pub output: Option<String>,
    pub project_directory: Option<PathBuf>,
    pub created_files: Vec<String>,
    pub generated_code: Option<String>,
    pub filename: Option<String>,
}

impl WorkerOutput {
    pub fn message(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn with_project_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_directory = Some(dir.into());
        self
    }

    pub fn with_created_file(mut self, path: impl Into<String>) -> Self {
        self.created_files.push(path.into());
        self
    }

    pub fn with_code(mut self, filename: impl Into<String>, code: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self.generated_code = Some(code.into());
        self
    }
}

/// Worker 失败：唯一会把状态机切到 error 并触发 ErrorResolver 的错误类别
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("Worker '{worker}' timed out after {secs}s")]
    Timeout { worker: String, secs: u64 },

    /// 命令在等待交互输入（如密码）；从不自动应答
    #[error("human_intervention_required: the command '{command}' requires interactive input (e.g. a password). The system cannot provide this.")]
    InteractivePrompt { command: String },

    #[error("Worker '{worker}' does not support the command: '{command}'")]
    Unsupported { worker: String, command: String },

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
}

/// Worker trait：统一的 run(command, state) 契约
#[async_trait]
pub trait Worker: Send + Sync {
    /// 注册名（计划中 "agent" 字段的取值）
    fn name(&self) -> &str;

    /// 描述（写入 Planner 提示词）
    fn description(&self) -> &str;

    /// 执行一条已解析的命令；内部错误一律映射为 WorkerError
    async fn run(&self, command: &Command, state: &SharedState) -> Result<WorkerOutput, WorkerError>;
}

/// Worker 注册表：按名称存储 Arc<dyn Worker>
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: impl Worker + 'static) {
        self.register_arc(Arc::new(worker));
    }

    pub fn register_arc(&mut self, worker: Arc<dyn Worker>) {
        let name = worker.name().to_string();
        self.workers.insert(name, worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// 返回 (name, description) 列表，用于生成 Planner 提示词中的可用 Worker 段落
    pub fn worker_descriptions(&self) -> Vec<(String, String)> {
        self.workers
            .iter()
            .map(|(name, w)| (name.clone(), w.description().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopWorker;

    #[async_trait]
    impl Worker for NoopWorker {
        fn name(&self) -> &str {
            "noop_agent"
        }

        fn description(&self) -> &str {
            "does nothing"
        }

        async fn run(&self, _command: &Command, _state: &SharedState) -> Result<WorkerOutput, WorkerError> {
            Ok(WorkerOutput::message("noop"))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = WorkerRegistry::new();
        registry.register(NoopWorker);
        assert!(registry.get("noop_agent").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.worker_names(), vec!["noop_agent".to_string()]);
        assert_eq!(registry.worker_descriptions()[0].1, "does nothing");
    }

    #[test]
    fn test_interactive_prompt_display_is_tagged() {
        let err = WorkerError::InteractivePrompt {
            command: "sudo apt install x".to_string(),
        };
        assert!(err.to_string().starts_with("human_intervention_required"));
    }
}
