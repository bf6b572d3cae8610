//! Planner：根据状态快照生成下一批子任务
//!
//! 每次调用只请求一次生成器，输出经 parse 边界校验后返回 ParseResult；
//! 两条硬性策略在解析后再确定性地执行一遍，不依赖模型是否遵守提示词。

use std::sync::Arc;

use crate::core::{Command, StateSnapshot, Subtask};
use crate::llm::{LlmClient, Message};
use crate::planning::parse::{extract_plan, ParseResult};
use crate::workers::FILE_AGENT;

const PLANNER_SYSTEM_PROMPT: &str = r#"You are the master Planner Agent. Your job is to create a JSON array of subtasks.
Each subtask is an object {"agent": "<worker name>", "description": "<command>"}.
You MUST use the following strict "Command Language" for the 'description' field.

Command Language Reference:
1. Allocate the project directory:
   {"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}
2. Allocate the project directory with a template (web_project, python_package, node_project):
   {"agent": "file_agent", "description": "CREATE STANDARD STRUCTURE web_project"}
3. Read an existing file's content into memory:
   {"agent": "file_agent", "description": "READ FILE 'filename.ext'"}
4. Create a new, empty file:
   {"agent": "file_agent", "description": "CREATE EMPTY FILE 'filename.ext'"}
5. Generate new code or modify existing code for a file:
   {"agent": "coder_agent", "description": "Generate code for 'filename.ext' that does..."}
   (The coder automatically receives the file's current content if it has been read.)
6. Save previously generated code to a file:
   {"agent": "file_agent", "description": "SAVE CODE TO 'filename.ext'"}
7. Run a shell command:
   {"agent": "shell_agent", "description": "executable_command_string"}

Workflow logic:
- To modify an existing project, first READ FILE every file that needs to change, then call coder_agent.
- For a new project do not use READ FILE. Start by creating the structure and the files.
- After the code is generated, SAVE CODE for each generated file.
- Finally run any shell commands needed to install dependencies, test or execute.
- Keep the plan short (about 5 to 8 steps). You will be called again with the updated state.

Your output MUST be ONLY the JSON array. No other text."#;

/// Planner：持有 LLM 与可用 Worker 列表
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    workers: Vec<(String, String)>,
    history_window: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, workers: Vec<(String, String)>, history_window: usize) -> Self {
        Self {
            llm,
            workers,
            history_window,
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 生成下一批子任务；生成器错误与空输出都体现在 ParseResult 中，不向上抛
    pub async fn plan(&self, snapshot: &StateSnapshot) -> ParseResult {
        let messages = vec![
            Message::system(self.system_prompt()),
            Message::user(self.planning_prompt(snapshot)),
        ];

        tracing::info!(task = %snapshot.original_task, "planner is creating a plan");
        let raw = match self.llm.complete(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "planner generator call failed");
                return ParseResult::Malformed(format!("generator call failed: {e}"));
            }
        };
        tracing::debug!(raw = %preview(&raw, 300), "raw planner response");

        match extract_plan(&raw) {
            ParseResult::Plan(plan) => {
                let plan = enforce_policies(plan, snapshot);
                if plan.is_empty() {
                    tracing::warn!("every planned step was dropped by planning policies");
                    return ParseResult::Empty;
                }
                tracing::info!(steps = plan.len(), "planner created a new plan");
                ParseResult::Plan(plan)
            }
            other => {
                tracing::warn!(result = ?other, "planner failed to generate a valid plan");
                other
            }
        }
    }

    fn system_prompt(&self) -> String {
        if self.workers.is_empty() {
            return PLANNER_SYSTEM_PROMPT.to_string();
        }
        let workers = self
            .workers
            .iter()
            .map(|(name, desc)| format!("- {name}: {desc}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{PLANNER_SYSTEM_PROMPT}\n\nAvailable agents:\n{workers}\n- human_intervention: stop and ask the user (only when nothing else can work)")
    }

    /// 有界上下文：任务、状态、文件、最近错误、最近 N 条 history、文档是否已加载
    pub(crate) fn planning_prompt(&self, snapshot: &StateSnapshot) -> String {
        let project_directory = snapshot
            .project_directory
            .as_deref()
            .unwrap_or("Not created yet.");
        let files = if snapshot.created_files.is_empty() {
            "None".to_string()
        } else {
            snapshot.created_files.join(", ")
        };
        let generated = if snapshot.generated_code_keys.is_empty() {
            "None".to_string()
        } else {
            snapshot.generated_code_keys.join(", ")
        };
        let history = snapshot
            .recent_history(self.history_window)
            .iter()
            .map(|h| format!("  - {h}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut rules = Vec::new();
        if snapshot.project_directory.is_none() {
            rules.push(
                "- The project directory is not set: the FIRST step must be CREATE PROJECT STRUCTURE or CREATE STANDARD STRUCTURE <type>.",
            );
        }
        if snapshot.is_existing_project {
            rules.push("- This is an existing project: READ FILE the files you need to change before modifying them.");
        }
        if snapshot.document_content.is_some() {
            rules.push(
                "- The source document is ALREADY loaded into memory. Do NOT add any READ FILE step for it; only generate and save code.",
            );
        }

        format!(
            "Given the current state of the project, create the next set of subtasks.\n\n\
             Current Project State:\n\
             - Original Task: {task}\n\
             - Current Status: {status}\n\
             - Project Directory: {project_directory}\n\
             - Existing Project: {existing}\n\
             - Files Created: {files}\n\
             - Generated Code Available For: {generated}\n\
             - Source Document Loaded: {document}\n\
             - Last Execution Error: {error}\n\
             - Execution History:\n{history}\n\n\
             Rules for this plan:\n{rules}\n\n\
             Return ONLY the JSON array.",
            task = snapshot.original_task,
            status = snapshot.current_status,
            existing = if snapshot.is_existing_project { "yes" } else { "no" },
            document = if snapshot.document_content.is_some() { "yes" } else { "no" },
            error = snapshot.last_execution_error.as_deref().unwrap_or("None"),
            rules = if rules.is_empty() { "- none".to_string() } else { rules.join("\n") },
        )
    }
}

/// 已加载文档时去掉 READ FILE；未设置项目目录时保证第一步是结构创建
fn enforce_policies(mut plan: Vec<Subtask>, snapshot: &StateSnapshot) -> Vec<Subtask> {
    if snapshot.document_content.is_some() {
        plan.retain(|subtask| {
            let is_read = matches!(Command::parse(&subtask.description), Ok(Command::ReadFile(_)));
            if is_read {
                tracing::warn!(subtask = %subtask, "dropping READ FILE step, document already loaded");
            }
            !is_read
        });
    }

    if snapshot.project_directory.is_none() {
        let starts_with_structure = plan.first().is_some_and(|first| {
            matches!(
                Command::parse(&first.description),
                Ok(Command::CreateStructure | Command::CreateStandardStructure(_))
            )
        });
        if !plan.is_empty() && !starts_with_structure {
            tracing::info!("prepending structure creation, project directory not set");
            plan.insert(0, Subtask::new(FILE_AGENT, Command::CreateStructure.to_string()));
        }
    }

    plan
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SharedState;
    use crate::llm::MockLlmClient;

    fn planner(mock: Arc<MockLlmClient>) -> Planner {
        Planner::new(
            mock,
            vec![("file_agent".to_string(), "file operations".to_string())],
            5,
        )
    }

    #[tokio::test]
    async fn test_plan_parses_generator_output() {
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}, {"agent": "coder_agent", "description": "Generate code for 'main.py' that prints hi"}]"#,
        ]));
        let state = SharedState::new("print hi in python");
        let plan = planner(mock.clone()).plan(&state.full_context()).await;
        assert_eq!(plan.into_plan().unwrap().len(), 2);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_generator_error_is_not_a_plan() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error("rate limited");
        let state = SharedState::new("task");
        let result = planner(mock).plan(&state.full_context()).await;
        assert!(matches!(result, ParseResult::Malformed(ref r) if r.contains("rate limited")));
    }

    #[tokio::test]
    async fn test_empty_response_is_empty() {
        let mock = Arc::new(MockLlmClient::with_responses(["[]"]));
        let state = SharedState::new("task");
        assert_eq!(planner(mock).plan(&state.full_context()).await, ParseResult::Empty);
    }

    #[tokio::test]
    async fn test_structure_creation_prepended_when_directory_missing() {
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "shell_agent", "description": "python3 main.py"}]"#,
        ]));
        let state = SharedState::new("task");
        let plan = planner(mock).plan(&state.full_context()).await.into_plan().unwrap();
        assert_eq!(plan[0], Subtask::new("file_agent", "CREATE PROJECT STRUCTURE"));
        assert_eq!(plan.len(), 2);
    }

    #[tokio::test]
    async fn test_read_file_dropped_when_document_loaded() {
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "READ FILE 'spec.txt'"}, {"agent": "coder_agent", "description": "Generate code for 'app.py'"}]"#,
        ]));
        let mut state = SharedState::new("task");
        state.set_project_directory("/tmp/x", false);
        state.set_document_content("requirements...");
        let plan = planner(mock).plan(&state.full_context()).await.into_plan().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].agent, "coder_agent");
    }

    #[tokio::test]
    async fn test_plan_of_only_dropped_reads_is_empty() {
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "READ FILE 'spec.txt'"}]"#,
        ]));
        let mut state = SharedState::new("task");
        state.set_project_directory("/tmp/x", false);
        state.set_document_content("requirements...");
        let result = planner(mock).plan(&state.full_context()).await;
        assert_eq!(result, ParseResult::Empty);
        assert_eq!(result.failure_reason().as_deref(), Some("planner returned an empty plan"));
    }

    #[tokio::test]
    async fn test_prompt_carries_bounded_history() {
        let mock = Arc::new(MockLlmClient::new());
        let mut state = SharedState::new("build a calculator");
        for i in 0..10 {
            state.note(format!("entry {i}"));
        }
        let p = planner(mock.clone());
        let _ = p.plan(&state.full_context()).await;
        let prompt = &mock.prompts()[0];
        assert!(prompt.contains("build a calculator"));
        assert!(prompt.contains("entry 9"));
        assert!(prompt.contains("entry 5"));
        assert!(!prompt.contains("entry 4"));
        assert!(prompt.contains("Not created yet."));
    }
}
