//! 编排器集成测试：脚本化 LLM + 脚本化 / 真实 Worker，覆盖主循环的各条路径

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use ultron::config::AppConfig;
    use ultron::core::{Command, Orchestrator, SharedState, TaskStatus, ToolProbe};
    use ultron::llm::MockLlmClient;
    use ultron::workers::{
        CoderWorker, FileWorker, Worker, WorkerError, WorkerOutput, WorkerRegistry,
    };

    /// 按脚本返回结果的 Worker，并记录收到的命令
    struct ScriptedWorker {
        name: &'static str,
        script: Mutex<VecDeque<Result<WorkerOutput, WorkerError>>>,
        fallback: Result<WorkerOutput, WorkerError>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedWorker {
        fn new(
            name: &'static str,
            script: Vec<Result<WorkerOutput, WorkerError>>,
            fallback: Result<WorkerOutput, WorkerError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script.into()),
                fallback,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "scripted test worker"
        }

        async fn run(&self, command: &Command, _state: &SharedState) -> Result<WorkerOutput, WorkerError> {
            self.seen.lock().unwrap().push(command.to_string());
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl Worker for PanickingWorker {
        fn name(&self) -> &str {
            "shell_agent"
        }

        fn description(&self) -> &str {
            "panics"
        }

        async fn run(&self, _command: &Command, _state: &SharedState) -> Result<WorkerOutput, WorkerError> {
            panic!("worker exploded");
        }
    }

    struct MissingEverything;

    impl ToolProbe for MissingEverything {
        fn is_installed(&self, _tool: &str) -> bool {
            false
        }
    }

    fn config(root: &Path) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.projects_root = root.to_path_buf();
        cfg
    }

    fn orchestrator(cfg: &AppConfig, mock: &Arc<MockLlmClient>, registry: WorkerRegistry) -> Orchestrator {
        Orchestrator::new(cfg, mock.clone(), registry).unwrap()
    }

    #[tokio::test]
    async fn test_empty_plan_fails_without_executing() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::with_responses(["I cannot help with that. []"]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("build calculator app", &[]).await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.context.created_files.is_empty());
        assert!(report.context.last_subtask.is_none());
        assert!(report.context.history.iter().any(|h| h.starts_with("Planning failed")));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_create_project_structure_sets_directory_once() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}]"#,
        ]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("build calculator app", &[]).await;

        assert_eq!(report.status, TaskStatus::Completed);
        let dir = root.path().join("build-calculator-app");
        assert!(dir.is_dir());
        let dir_str = dir.display().to_string();
        assert_eq!(report.context.project_directory.as_deref(), Some(dir_str.as_str()));
        let mentions = report
            .context
            .history
            .iter()
            .filter(|h| h.contains(&dir_str))
            .count();
        assert_eq!(mentions, 1);
    }

    #[tokio::test]
    async fn test_planner_is_asked_again_after_each_batch() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}]"#,
            r#"[{"agent": "file_agent", "description": "CREATE EMPTY FILE 'main.py'"}]"#,
            "[]",
        ]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("build calculator app", &[]).await;

        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(mock.calls(), 3);
        assert!(root.path().join("build-calculator-app").join("main.py").is_file());
        let plans = report
            .context
            .history
            .iter()
            .filter(|h| h.starts_with("Execution plan has been updated"))
            .count();
        assert_eq!(plans, 2);
        assert!(report
            .context
            .history
            .iter()
            .any(|h| h == "Planner produced no further steps."));
        // 第二批的提示词能看到第一批的执行结果
        assert!(mock.prompts()[1].contains("build-calculator-app"));
    }

    #[tokio::test]
    async fn test_plan_round_limit_completes_run() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}]"#,
            r#"[{"agent": "file_agent", "description": "CREATE EMPTY FILE 'never.py'"}]"#,
        ]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        let mut cfg = config(root.path());
        cfg.planner.max_rounds = 1;
        let orch = orchestrator(&cfg, &mock, registry);

        let report = orch.execute_task("build calculator app", &[]).await;

        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(mock.calls(), 1);
        assert!(!root.path().join("build-calculator-app").join("never.py").exists());
    }

    #[tokio::test]
    async fn test_malformed_command_fails_without_resolver() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "SAVE CODE TO index.html"}]"#,
        ]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("update the landing page of 'shop'", &[]).await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(mock.calls(), 1);
        let history = &report.context.history;
        assert!(history.iter().any(|h| h.starts_with("Malformed command 'SAVE CODE TO index.html'")));
        assert!(!history.iter().any(|h| h.starts_with("Recovery plan")));
        assert!(report.context.last_execution_error.is_none());
        assert!(!root.path().join("shop").join("index.html").exists());
    }

    #[tokio::test]
    async fn test_permission_denied_uses_signature_plan_without_generator() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}, {"agent": "shell_agent", "description": "cp config /etc/app.conf"}]"#,
        ]));
        let shell = ScriptedWorker::new(
            "shell_agent",
            vec![Err(WorkerError::Failed("cp: /etc/app.conf: Permission denied".into()))],
            Ok(WorkerOutput::message("total 0")),
        );
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        registry.register_arc(shell.clone());
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("install app config", &[]).await;

        // 只有 Planner 调用过生成器
        assert_eq!(mock.calls(), 1);
        let seen = shell.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].starts_with("ls -la"));
        assert_eq!(report.status, TaskStatus::Failed);
        let message = report.intervention.unwrap();
        assert!(message.contains("ATTENTION REQUIRED"));
        assert!(message.contains("Permission denied"));
        assert!(report
            .context
            .history
            .iter()
            .any(|h| h.contains("Recovery plan (signature: permission denied) with 2 steps")));
    }

    #[tokio::test]
    async fn test_malformed_subtask_fails_run() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([r#"[{"agent": "file_agent"}]"#]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("add a cart page to 'shop'", &[]).await;

        assert!(report.context.is_existing_project);
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report
            .context
            .history
            .iter()
            .any(|h| h == "Malformed subtask received."));
        assert!(report.context.created_files.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_failures_terminate_via_loop_guard() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let mock = Arc::new(MockLlmClient::new());
        mock.push_response(r#"[{"agent": "shell_agent", "description": "./run.sh"}]"#);
        for _ in 0..20 {
            mock.push_response(r#"{"category": "other", "root_cause": "run.sh crashes"}"#);
            mock.push_response(r#"{"strategy": "try again", "steps": ["rerun"]}"#);
            mock.push_response(r#"[{"agent": "shell_agent", "description": "./run.sh"}]"#);
        }
        let shell = ScriptedWorker::new(
            "shell_agent",
            vec![],
            Err(WorkerError::Failed("segmentation fault".into())),
        );
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        registry.register_arc(shell.clone());
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("fix 'shop'", &[]).await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.intervention.is_some());
        let history = &report.context.history;
        assert!(history.iter().any(|h| h.starts_with("Recovery plan (fallback)")));
        // 兜底计划之后再次触发保护，直接请求人工
        assert!(history.iter().any(|h| h.starts_with("Recovery plan (human intervention)")));
        assert!(shell.seen().len() < 20);
    }

    #[tokio::test]
    async fn test_full_run_generates_and_saves_code() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"},
                {"agent": "coder_agent", "description": "Generate code for 'main.py' that prints hello"},
                {"agent": "file_agent", "description": "SAVE CODE TO 'main.py'"}]"#,
            "<<START_CODE>>print('hello')<<END_CODE>>",
            "No issues found.",
        ]));
        let mut registry = WorkerRegistry::new();
        registry.register(FileWorker::new(root.path()));
        registry.register_arc(Arc::new(CoderWorker::new(mock.clone(), true, 1000)));
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("hello world script", &[]).await;

        assert_eq!(report.status, TaskStatus::Completed);
        assert!(report.succeeded());
        let file = root.path().join("hello-world-script").join("main.py");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "print('hello')");
        assert_eq!(report.context.generated_code_keys, vec!["main.py".to_string()]);
        assert_eq!(report.context.created_files, vec![file.display().to_string()]);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_missing_tools_fail_before_planning() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::new());
        let orch = orchestrator(&config(root.path()), &mock, WorkerRegistry::new())
            .with_probe(MissingEverything);

        let report = orch
            .execute_task("build it", &["node".to_string(), "npm".to_string()])
            .await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(mock.calls(), 0);
        assert!(report.intervention.unwrap().contains("node, npm"));
    }

    #[tokio::test]
    async fn test_document_is_loaded_before_planning() {
        let root = TempDir::new().unwrap();
        let mock = Arc::new(MockLlmClient::new());
        let orch = orchestrator(&config(root.path()), &mock, WorkerRegistry::new());

        let report = orch
            .execute_task_with_document("implement the spec", &[], Some("REQ-1: add numbers".into()))
            .await;

        assert_eq!(report.context.document_content.as_deref(), Some("REQ-1: add numbers"));
        assert!(mock.prompts()[0].contains("Source Document Loaded: yes"));
    }

    #[tokio::test]
    async fn test_unknown_worker_goes_through_resolver() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "deploy_agent", "description": "ship it"}]"#,
        ]));
        let orch = orchestrator(&config(root.path()), &mock, WorkerRegistry::new());

        let report = orch.execute_task("deploy 'shop'", &[]).await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report
            .context
            .history
            .iter()
            .any(|h| h.contains("Unknown worker: deploy_agent")));
        // 生成器流水线无输出 → 人工介入
        assert!(report.intervention.unwrap().contains("Automatic error resolution failed"));
    }

    #[tokio::test]
    async fn test_iteration_limit_ends_run() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "shell_agent", "description": "true"}, {"agent": "shell_agent", "description": "true"}, {"agent": "shell_agent", "description": "true"}, {"agent": "shell_agent", "description": "true"}]"#,
        ]));
        let shell = ScriptedWorker::new("shell_agent", vec![], Ok(WorkerOutput::message("ok")));
        let mut registry = WorkerRegistry::new();
        registry.register_arc(shell.clone());
        let mut cfg = config(root.path());
        cfg.app.max_iterations = 3;
        let orch = orchestrator(&cfg, &mock, registry);

        let report = orch.execute_task("check 'shop'", &[]).await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(shell.seen().len(), 2);
        assert!(report
            .context
            .history
            .iter()
            .any(|h| h == "Iteration limit of 3 reached."));
    }

    #[tokio::test]
    async fn test_panicking_worker_marks_run_failed() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("shop")).unwrap();
        let mock = Arc::new(MockLlmClient::with_responses([
            r#"[{"agent": "shell_agent", "description": "make"}]"#,
        ]));
        let mut registry = WorkerRegistry::new();
        registry.register(PanickingWorker);
        let orch = orchestrator(&config(root.path()), &mock, registry);

        let report = orch.execute_task("build 'shop'", &[]).await;

        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report
            .context
            .history
            .iter()
            .any(|h| h.contains("worker exploded")));
    }
}
