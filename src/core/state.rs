//! 共享状态：一次任务运行内的唯一事实来源
//!
//! SharedState 只由 Orchestrator 写入；Worker / Planner / Resolver 只读（借用或快照）。
//! 每个修改方法恰好追加一条 history 记录，history 的最后若干条会回灌给 Planner / Resolver 作为工作记忆。

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 执行成功时写入 history 的输出预览长度
const OUTPUT_PREVIEW_CHARS: usize = 100;

/// 编排状态机的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Planning,
    Executing,
    Error,
    Completed,
    Failed,
}

impl TaskStatus {
    /// completed / failed 为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Error => "error",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计划中的一步：{agent, description}
///
/// 缺失字段反序列化为空字符串，由 Orchestrator 在弹出时判定为畸形子任务。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub description: String,
}

impl Subtask {
    pub fn new(agent: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            description: description.into(),
        }
    }

    /// agent 与 description 都非空
    pub fn is_well_formed(&self) -> bool {
        !self.agent.trim().is_empty() && !self.description.trim().is_empty()
    }
}

impl fmt::Display for Subtask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.agent, self.description)
    }
}

/// 一次任务运行的可变状态
#[derive(Clone, Debug)]
pub struct SharedState {
    original_task: String,
    current_status: TaskStatus,
    current_plan: VecDeque<Subtask>,
    last_subtask: Option<Subtask>,
    project_directory: Option<PathBuf>,
    is_existing_project: bool,
    created_files: Vec<String>,
    generated_code: BTreeMap<String, String>,
    document_content: Option<String>,
    last_execution_output: Option<String>,
    last_execution_error: Option<String>,
    history: Vec<String>,
}

impl SharedState {
    pub fn new(original_task: impl Into<String>) -> Self {
        Self {
            original_task: original_task.into(),
            current_status: TaskStatus::Planning,
            current_plan: VecDeque::new(),
            last_subtask: None,
            project_directory: None,
            is_existing_project: false,
            created_files: Vec::new(),
            generated_code: BTreeMap::new(),
            document_content: None,
            last_execution_output: None,
            last_execution_error: None,
            history: Vec::new(),
        }
    }

    pub fn original_task(&self) -> &str {
        &self.original_task
    }

    pub fn status(&self) -> TaskStatus {
        self.current_status
    }

    pub fn plan(&self) -> &VecDeque<Subtask> {
        &self.current_plan
    }

    pub fn last_subtask(&self) -> Option<&Subtask> {
        self.last_subtask.as_ref()
    }

    pub fn project_directory(&self) -> Option<&Path> {
        self.project_directory.as_deref()
    }

    pub fn is_existing_project(&self) -> bool {
        self.is_existing_project
    }

    pub fn created_files(&self) -> &[String] {
        &self.created_files
    }

    pub fn generated_code(&self) -> &BTreeMap<String, String> {
        &self.generated_code
    }

    pub fn document_content(&self) -> Option<&str> {
        self.document_content.as_deref()
    }

    pub fn last_execution_output(&self) -> Option<&str> {
        self.last_execution_output.as_deref()
    }

    pub fn last_execution_error(&self) -> Option<&str> {
        self.last_execution_error.as_deref()
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn update_status(&mut self, new_status: TaskStatus) {
        self.current_status = new_status;
        self.history.push(format!("Status changed to: {new_status}"));
    }

    /// 整体替换剩余计划
    pub fn update_plan(&mut self, plan: Vec<Subtask>) {
        self.current_plan = plan.into();
        self.history.push(format!(
            "Execution plan has been updated ({} steps).",
            self.current_plan.len()
        ));
    }

    /// 错误恢复：把修复步骤插到剩余计划之前；label 标明计划来源（fallback / signature / generated ...）
    pub fn prepend_plan(&mut self, plan: Vec<Subtask>, label: &str) {
        let count = plan.len();
        for subtask in plan.into_iter().rev() {
            self.current_plan.push_front(subtask);
        }
        self.history.push(format!(
            "Recovery plan ({label}) with {count} steps prepended."
        ));
    }

    /// 弹出下一步并记录为 last_subtask；计划为空时返回 None 且不记录
    pub fn pop_next_subtask(&mut self) -> Option<Subtask> {
        let subtask = self.current_plan.pop_front()?;
        self.history.push(format!("Executing subtask: {subtask}"));
        self.last_subtask = Some(subtask.clone());
        Some(subtask)
    }

    /// 按路径去重；已存在时不修改、不记录
    pub fn add_created_file(&mut self, file_path: impl Into<String>) {
        let file_path = file_path.into();
        if !self.created_files.contains(&file_path) {
            self.history.push(format!("File created: {file_path}"));
            self.created_files.push(file_path);
        }
    }

    /// 后写覆盖先写
    pub fn add_generated_code(&mut self, filename: impl Into<String>, code: impl Into<String>) {
        let filename = filename.into();
        self.history.push(format!("Code generated for {filename}."));
        self.generated_code.insert(filename, code.into());
    }

    pub fn set_project_directory(&mut self, path: impl Into<PathBuf>, from_prompt: bool) {
        let path = path.into();
        if from_prompt {
            self.is_existing_project = true;
            self.history
                .push(format!("Project directory set from prompt: {}", path.display()));
        } else {
            self.history
                .push(format!("Project directory set to: {}", path.display()));
        }
        self.project_directory = Some(path);
    }

    pub fn set_document_content(&mut self, content: impl Into<String>) {
        let content = content.into();
        self.history.push(format!(
            "Document content loaded into memory ({} chars).",
            content.chars().count()
        ));
        self.document_content = Some(content);
    }

    /// 记录最近一次执行结果；error 非空时同一条记录内把状态切到 error
    pub fn log_execution_output(&mut self, output: Option<String>, error: Option<String>) {
        self.last_execution_output = output;
        self.last_execution_error = error;
        match &self.last_execution_error {
            Some(err) => {
                self.current_status = TaskStatus::Error;
                self.history.push(format!(
                    "Execution resulted in an error: {err} (status changed to: {})",
                    TaskStatus::Error
                ));
            }
            None => {
                let preview = self
                    .last_execution_output
                    .as_deref()
                    .map(|o| o.chars().take(OUTPUT_PREVIEW_CHARS).collect::<String>())
                    .filter(|o| !o.is_empty())
                    .unwrap_or_else(|| "No output.".to_string());
                self.history
                    .push(format!("Execution successful. Output: {preview}"));
            }
        }
    }

    /// 仅追加一条说明（失败原因、人工介入等）
    pub fn note(&mut self, message: impl Into<String>) {
        self.history.push(message.into());
    }

    /// 导出只读快照（路径转字符串），供 Planner / Resolver / 日志使用
    pub fn full_context(&self) -> StateSnapshot {
        StateSnapshot {
            original_task: self.original_task.clone(),
            current_status: self.current_status,
            current_plan: self.current_plan.iter().cloned().collect(),
            last_subtask: self.last_subtask.clone(),
            project_directory: self
                .project_directory
                .as_ref()
                .map(|p| p.display().to_string()),
            is_existing_project: self.is_existing_project,
            created_files: self.created_files.clone(),
            generated_code_keys: self.generated_code.keys().cloned().collect(),
            document_content: self.document_content.clone(),
            last_execution_output: self.last_execution_output.clone(),
            last_execution_error: self.last_execution_error.clone(),
            history: self.history.clone(),
        }
    }
}

/// SharedState 的只读导出视图
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub original_task: String,
    pub current_status: TaskStatus,
    pub current_plan: Vec<Subtask>,
    pub last_subtask: Option<Subtask>,
    pub project_directory: Option<String>,
    pub is_existing_project: bool,
    pub created_files: Vec<String>,
    pub generated_code_keys: Vec<String>,
    pub document_content: Option<String>,
    pub last_execution_output: Option<String>,
    pub last_execution_error: Option<String>,
    pub history: Vec<String>,
}

impl StateSnapshot {
    /// 最近 n 条 history
    pub fn recent_history(&self, n: usize) -> &[String] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }
}
