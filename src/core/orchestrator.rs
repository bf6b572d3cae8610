//! 编排器：planning → executing ⇄ error → … → completed | failed 状态机
//!
//! Orchestrator 是 SharedState 的唯一写入者。每次迭代只处理一个状态：
//! - planning：调用 Planner，非空计划进入 executing；首批为空 → failed（不经过 Resolver），
//!   之后的批次为空 → completed
//! - executing：弹出一个子任务；计划耗尽后回到 planning 请求下一批（达到 max_rounds 即 completed）；
//!   畸形子任务 / 畸形命令 → failed；
//!   human_intervention → 渲染求助信息后 failed；其余派发给对应 Worker，失败进入 error
//! - error：调用 ErrorResolver，把修复步骤插到剩余计划前，回到 executing
//!
//! 每次迭代包在 catch_unwind 中，任何意外都把运行标记为 failed；另有 max_iterations 兜底。

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::preflight::{check_dependencies, missing_tools, ToolProbe, WhichProbe};
use crate::core::{
    render_help_request, Command, OrchestratorError, SharedState, StateSnapshot, TaskStatus,
    HUMAN_INTERVENTION,
};
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::planning::{ErrorResolver, ParseResult, Planner, ResolverGuard};
use crate::workers::file::detect_existing_project;
use crate::workers::{
    CoderWorker, FileWorker, SearchWorker, ShellWorker, WorkerDispatcher, WorkerOutput,
    WorkerRegistry,
};

const UNKNOWN_FILE: &str = "unknown_file.txt";

/// 一次运行的结果
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: TaskStatus,
    pub context: StateSnapshot,
    /// 以人工介入结束时的求助信息
    pub intervention: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, OrchestratorError> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = cfg.llm.timeouts.request;
    if !matches!(provider.as_str(), "deepseek" | "openai" | "mock") {
        return Err(OrchestratorError::Llm(format!(
            "unknown provider '{}' (expected deepseek, openai or mock)",
            cfg.llm.provider
        )));
    }
    if provider == "mock" {
        tracing::warn!("Mock LLM configured explicitly");
        return Ok(Arc::new(MockLlmClient::new()));
    }

    // 有 DeepSeek Key 或（配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点）
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using DeepSeek LLM ({})", model);
        Ok(Arc::new(create_deepseek_client(Some(model.as_str())).with_request_timeout(timeout)))
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        Ok(Arc::new(
            OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            )
            .with_request_timeout(timeout),
        ))
    } else {
        tracing::warn!("No API key set, using Mock LLM (planning will produce no plan)");
        Ok(Arc::new(MockLlmClient::new()))
    }
}

/// 按配置注册四个内置 Worker
pub fn default_registry(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> WorkerRegistry {
    let workers = &cfg.workers;
    let mut registry = WorkerRegistry::new();
    registry.register(FileWorker::new(cfg.app.projects_root.clone()));
    registry.register(ShellWorker::new(
        workers.shell.command_timeout_secs,
        workers.shell.prompt_patterns.clone(),
        workers.shell.forbidden_patterns.clone(),
    ));
    registry.register(CoderWorker::new(
        llm,
        workers.coder.review,
        workers.coder.max_document_chars,
    ));
    registry.register(SearchWorker::new(
        workers.search.endpoint.clone(),
        workers.search.timeout_secs,
        workers.search.max_result_chars,
    ));
    registry
}

fn validate(cfg: &AppConfig) -> Result<(), OrchestratorError> {
    if cfg.app.max_iterations == 0 {
        return Err(OrchestratorError::Config("app.max_iterations must be > 0".into()));
    }
    if cfg.planner.max_rounds == 0 {
        return Err(OrchestratorError::Config("planner.max_rounds must be > 0".into()));
    }
    if cfg.app.projects_root.as_os_str().is_empty() {
        return Err(OrchestratorError::Config("app.projects_root must not be empty".into()));
    }
    if cfg.resolver.error_window == 0 || cfg.resolver.error_threshold == 0 {
        return Err(OrchestratorError::Config(
            "resolver.error_window and resolver.error_threshold must be > 0".into(),
        ));
    }

    // 派发超时要容纳最慢的 Worker：coder 最多三次 LLM 调用，shell 自带命令超时
    let coder_calls = if cfg.workers.coder.review { 3 } else { 1 };
    let slowest = (coder_calls * cfg.llm.timeouts.request)
        .max(cfg.workers.shell.command_timeout_secs)
        .max(cfg.workers.search.timeout_secs);
    if cfg.workers.dispatch_timeout_secs <= slowest {
        return Err(OrchestratorError::Config(format!(
            "workers.dispatch_timeout_secs ({}) must exceed the slowest worker budget ({slowest}s)",
            cfg.workers.dispatch_timeout_secs
        )));
    }
    Ok(())
}

/// 编排器：持有 Planner、Resolver 与 Worker 派发器
pub struct Orchestrator {
    planner: Planner,
    resolver: ErrorResolver,
    dispatcher: WorkerDispatcher,
    probe: Box<dyn ToolProbe>,
    projects_root: PathBuf,
    max_iterations: usize,
    max_plan_rounds: usize,
}

impl Orchestrator {
    /// 使用给定 LLM 与 Worker 注册表构建；其余参数取自配置
    pub fn new(cfg: &AppConfig, llm: Arc<dyn LlmClient>, registry: WorkerRegistry) -> Result<Self, OrchestratorError> {
        validate(cfg)?;
        let planner = Planner::new(
            llm.clone(),
            registry.worker_descriptions(),
            cfg.planner.history_window,
        );
        let guard = ResolverGuard {
            max_history: cfg.resolver.max_history,
            error_window: cfg.resolver.error_window,
            error_threshold: cfg.resolver.error_threshold,
        };
        let resolver = ErrorResolver::new(llm, guard, cfg.planner.history_window);
        let dispatcher = WorkerDispatcher::new(registry, cfg.workers.dispatch_timeout_secs);
        Ok(Self {
            planner,
            resolver,
            dispatcher,
            probe: Box::new(WhichProbe),
            projects_root: cfg.app.projects_root.clone(),
            max_iterations: cfg.app.max_iterations,
            max_plan_rounds: cfg.planner.max_rounds,
        })
    }

    /// 按配置选择 LLM 并注册内置 Worker
    pub fn from_config(cfg: &AppConfig) -> Result<Self, OrchestratorError> {
        let llm = create_llm_from_config(cfg)?;
        let registry = default_registry(cfg, llm.clone());
        Self::new(cfg, llm, registry)
    }

    /// 替换工具预检实现
    pub fn with_probe(mut self, probe: impl ToolProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.dispatcher.worker_names()
    }

    pub async fn execute_task(&self, task: &str, required_tools: &[String]) -> RunReport {
        self.execute_task_with_document(task, required_tools, None).await
    }

    /// 入口：预检 → 识别已有项目 → 主循环；document 非空时预先载入 document_content
    pub async fn execute_task_with_document(
        &self,
        task: &str,
        required_tools: &[String],
        document: Option<String>,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = tracing::info_span!("run", run_id = %run_id);

        async move {
            tracing::info!(task = %task, "starting task");
            let mut state = SharedState::new(task);
            if let Some(document) = document {
                state.set_document_content(document);
            }

            let intervention = match self.preflight(&mut state, required_tools) {
                Some(message) => Some(message),
                None => {
                    if let Some(dir) = detect_existing_project(task, &self.projects_root) {
                        tracing::info!(dir = %dir.display(), "task refers to an existing project");
                        state.set_project_directory(dir, true);
                    }
                    self.run(&mut state).await
                }
            };

            let (prompt, completion, total) = self.planner.token_usage();
            tracing::info!(
                status = %state.status(),
                history = state.history().len(),
                prompt_tokens = prompt,
                completion_tokens = completion,
                total_tokens = total,
                "task finished"
            );

            RunReport {
                run_id,
                status: state.status(),
                context: state.full_context(),
                intervention,
                started_at,
                finished_at: Utc::now(),
            }
        }
        .instrument(span)
        .await
    }

    /// 缺少工具时直接结束运行，返回求助信息
    fn preflight(&self, state: &mut SharedState, required_tools: &[String]) -> Option<String> {
        if required_tools.is_empty() {
            return None;
        }
        let status = check_dependencies(self.probe.as_ref(), required_tools);
        let missing = missing_tools(&status);
        if missing.is_empty() {
            return None;
        }
        let list = missing.join(", ");
        state.note(format!("Pre-flight check failed, missing tools: {list}"));
        state.update_status(TaskStatus::Failed);
        let message = render_help_request(&format!(
            "The following required tools are not installed: {list}. Install them, then restart the task."
        ));
        tracing::warn!("{message}");
        Some(message)
    }

    /// 主循环：直到终态或达到迭代上限；返回人工介入信息（如有）
    pub async fn run(&self, state: &mut SharedState) -> Option<String> {
        let mut intervention = None;
        let mut iterations = 0;
        let mut rounds = 0;

        while !state.status().is_terminal() {
            if iterations >= self.max_iterations {
                state.note(format!("Iteration limit of {} reached.", self.max_iterations));
                state.update_status(TaskStatus::Failed);
                break;
            }
            iterations += 1;

            match AssertUnwindSafe(self.step(state, &mut rounds)).catch_unwind().await {
                Ok(Ok(None)) => {}
                Ok(Ok(Some(message))) => intervention = Some(message),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "run failed");
                    state.note(e.to_string());
                    state.update_status(TaskStatus::Failed);
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(reason = %reason, "unexpected failure in orchestrator loop");
                    state.note(format!("Unexpected failure in orchestrator loop: {reason}"));
                    state.update_status(TaskStatus::Failed);
                }
            }
        }
        intervention
    }

    /// 处理当前状态一次；Err 表示运行应以 failed 结束
    ///
    /// rounds 为已安装的计划批次数：首批为空即失败，之后的空回复表示任务完成。
    async fn step(&self, state: &mut SharedState, rounds: &mut usize) -> Result<Option<String>, OrchestratorError> {
        match state.status() {
            TaskStatus::Planning => {
                match self.planner.plan(&state.full_context()).await {
                    ParseResult::Plan(plan) if !plan.is_empty() => {
                        *rounds += 1;
                        tracing::info!(round = *rounds, steps = plan.len(), "plan batch installed");
                        state.update_plan(plan);
                        state.update_status(TaskStatus::Executing);
                        Ok(None)
                    }
                    ParseResult::Plan(_) | ParseResult::Empty if *rounds > 0 => {
                        tracing::info!(rounds = *rounds, "planner has no further steps, task completed");
                        state.note("Planner produced no further steps.");
                        state.update_status(TaskStatus::Completed);
                        Ok(None)
                    }
                    other => Err(OrchestratorError::PlanningFailure(
                        other.failure_reason().unwrap_or_default(),
                    )),
                }
            }
            TaskStatus::Executing => {
                let Some(subtask) = state.pop_next_subtask() else {
                    if *rounds >= self.max_plan_rounds {
                        tracing::info!(rounds = *rounds, "plan round limit reached, task completed");
                        state.update_status(TaskStatus::Completed);
                    } else {
                        tracing::info!(rounds = *rounds, "plan batch finished, re-planning");
                        state.update_status(TaskStatus::Planning);
                    }
                    return Ok(None);
                };
                if !subtask.is_well_formed() {
                    return Err(OrchestratorError::MalformedSubtask);
                }

                if subtask.agent == HUMAN_INTERVENTION {
                    let message = render_help_request(&subtask.description);
                    tracing::warn!("{message}");
                    state.note(format!("Human intervention required: {}", subtask.description));
                    state.update_status(TaskStatus::Failed);
                    return Ok(Some(message));
                }

                let command = Command::parse(&subtask.description)?;
                tracing::info!(agent = %subtask.agent, command = %command, "dispatching subtask");
                match self.dispatcher.dispatch(&subtask.agent, &command, state).await {
                    Ok(output) => apply_output(state, output),
                    Err(e) => {
                        tracing::warn!(agent = %subtask.agent, error = %e, "subtask failed");
                        state.log_execution_output(None, Some(e.to_string()));
                    }
                }
                Ok(None)
            }
            TaskStatus::Error => {
                let resolution = self.resolver.resolve(&state.full_context()).await;
                tracing::info!(source = %resolution.source, steps = resolution.plan.len(), "recovery plan ready");
                state.prepend_plan(resolution.plan, &resolution.source.to_string());
                state.update_status(TaskStatus::Executing);
                Ok(None)
            }
            TaskStatus::Completed | TaskStatus::Failed => Ok(None),
        }
    }
}

/// 把 Worker 结果写回状态（唯一写入点）
fn apply_output(state: &mut SharedState, output: WorkerOutput) {
    let WorkerOutput {
        output,
        project_directory,
        created_files,
        generated_code,
        filename,
    } = output;

    if let Some(dir) = project_directory {
        state.set_project_directory(dir, false);
    }
    for file in created_files {
        state.add_created_file(file);
    }
    if let Some(code) = generated_code {
        state.add_generated_code(filename.unwrap_or_else(|| UNKNOWN_FILE.to_string()), code);
    }
    state.log_execution_output(output, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_output_updates_state() {
        let mut state = SharedState::new("t");
        let output = WorkerOutput::message("done")
            .with_project_directory("/p")
            .with_created_file("/p/a.py")
            .with_code("a.py", "print(1)");
        apply_output(&mut state, output);
        assert_eq!(state.project_directory(), Some(std::path::Path::new("/p")));
        assert_eq!(state.created_files(), ["/p/a.py"]);
        assert_eq!(state.generated_code()["a.py"], "print(1)");
        assert_eq!(state.last_execution_output(), Some("done"));
        assert_eq!(state.history().len(), 4);
    }

    #[test]
    fn test_code_without_filename_is_stored_as_unknown() {
        let mut state = SharedState::new("t");
        let output = WorkerOutput {
            generated_code: Some("x".into()),
            ..Default::default()
        };
        apply_output(&mut state, output);
        assert!(state.generated_code().contains_key("unknown_file.txt"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = AppConfig::default();
        cfg.app.max_iterations = 0;
        let err = Orchestrator::new(&cfg, Arc::new(MockLlmClient::new()), WorkerRegistry::new())
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_dispatch_timeout_must_cover_coder_cycle() {
        let mut cfg = AppConfig::default();
        assert!(validate(&cfg).is_ok());

        cfg.workers.dispatch_timeout_secs = 300;
        assert!(matches!(validate(&cfg), Err(OrchestratorError::Config(ref m)) if m.contains("360s")));

        cfg.workers.coder.review = false;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "carrier-pigeon".into();
        assert!(matches!(create_llm_from_config(&cfg), Err(OrchestratorError::Llm(_))));
    }
}
