//! ErrorResolver：把一次 Worker 失败转换为要插到剩余计划之前的修复步骤
//!
//! 处理顺序：
//! 1. 循环保护（history 过长 / 最近窗口内 error 过多）→ 按任务关键词给出固定兜底计划，不调用生成器；
//!    同一次运行中第二次触发则直接请求人工介入
//! 2. 已知错误特征表 → 手写修复计划，不调用生成器
//! 3. 生成器三段流水线：根因分类 → 修复策略 → 计划生成，每段解析失败都有默认值
//! 4. 仍无计划 → 单个 human_intervention 步骤
//!
//! resolve 永不失败，执行循环的 error 分支因此总能拿到下一步。

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{Command, StateSnapshot, Subtask, HUMAN_INTERVENTION};
use crate::llm::{LlmClient, Message};
use crate::planning::parse::{extract_json_object, extract_plan};
use crate::workers::{CODER_AGENT, FILE_AGENT, SHELL_AGENT};

/// 兜底计划写入 history 时的标签，也用于识别「已经兜底过一次」
const FALLBACK_LABEL: &str = "fallback";

const WEB_KEYWORDS: &[&str] = &[
    "website", "web page", "webpage", "html", "css", "landing page", "portfolio", "frontend",
];
const NODE_KEYWORDS: &[&str] = &["node", "javascript", "express", "npm"];

const ROOT_CAUSE_SYSTEM: &str = "You are an expert AI error analyst. Classify the failure of the last step. \
Respond ONLY with a JSON object: {\"category\": \"<permissions|missing_tool|missing_file|dependency|syntax|environment|other>\", \"root_cause\": \"<one sentence>\"}.";

const STRATEGY_SYSTEM: &str = "You are an expert AI error resolution strategist. Given a root cause, propose how to fix it. \
Never change permissions or supply credentials. \
Respond ONLY with a JSON object: {\"strategy\": \"<one sentence>\", \"steps\": [\"<step>\", ...]}.";

const PLAN_SYSTEM: &str = r#"You are an expert AI Error Resolution Specialist. Turn the fix strategy into a JSON array plan using the strict Command Language:
- {"agent": "file_agent", "description": "CREATE PROJECT STRUCTURE"}
- {"agent": "file_agent", "description": "CREATE EMPTY FILE 'filename.ext'"}
- {"agent": "file_agent", "description": "READ FILE 'filename.ext'"}
- {"agent": "coder_agent", "description": "Generate code for 'filename.ext' that..."}
- {"agent": "file_agent", "description": "SAVE CODE TO 'filename.ext'"}
- {"agent": "shell_agent", "description": "mkdir -p directory_name"}
- {"agent": "shell_agent", "description": "executable_command_string"}
- {"agent": "human_intervention", "description": "clear description of what the user must do"}
If a command fails with "command not found", suggest an alternative tool.
If a command fails due to permissions, do not attempt to change permissions; use human_intervention.
Your output MUST be ONLY a valid JSON array of subtasks. No other text."#;

fn no_module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"No module named ['"]?([\w.\-]+)['"]?"#).expect("valid regex"))
}

fn cannot_find_module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"Cannot find module ['"]([^'"]+)['"]"#).expect("valid regex"))
}

/// "command not found" 的几种 shell 写法，按顺序尝试
fn command_not_found_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)command not found:\s*([\w.\-]+)",
            r"(?i)([\w.\-]+):\s*command not found",
            r"(?i)\d+:\s*([\w.\-]+):\s*not found",
        ]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("valid regex"))
        .collect()
    })
}

fn missing_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:'([^']+)'|"([^"]+)"|([^\s:'"]+)):?\s*No such file or directory"#)
            .expect("valid regex")
    })
}

/// 循环保护阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverGuard {
    /// history 超过该长度即触发兜底
    pub max_history: usize,
    /// 统计 "error" 的最近条数
    pub error_window: usize,
    /// 窗口内含 "error" 的条数达到该值即触发兜底
    pub error_threshold: usize,
}

impl Default for ResolverGuard {
    fn default() -> Self {
        Self {
            max_history: 20,
            error_window: 5,
            error_threshold: 3,
        }
    }
}

impl ResolverGuard {
    /// 触发原因；未触发返回 None
    pub fn check(&self, snapshot: &StateSnapshot) -> Option<String> {
        if snapshot.history.len() > self.max_history {
            return Some(format!(
                "history has {} entries (limit {})",
                snapshot.history.len(),
                self.max_history
            ));
        }
        let errors = snapshot
            .recent_history(self.error_window)
            .iter()
            .filter(|h| h.to_lowercase().contains("error"))
            .count();
        (errors >= self.error_threshold).then(|| {
            format!(
                "{errors} of the last {} history entries report errors",
                self.error_window
            )
        })
    }
}

/// 修复计划的来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionSource {
    /// 循环保护触发后的关键词兜底计划
    Fallback,
    /// 已知错误特征
    KnownSignature(&'static str),
    /// 生成器流水线
    Generated,
    /// 交给人工处理
    HumanIntervention,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionSource::Fallback => f.write_str(FALLBACK_LABEL),
            ResolutionSource::KnownSignature(name) => write!(f, "signature: {name}"),
            ResolutionSource::Generated => f.write_str("generated"),
            ResolutionSource::HumanIntervention => f.write_str("human intervention"),
        }
    }
}

/// resolve 的结果：修复前缀 + 来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub plan: Vec<Subtask>,
    pub source: ResolutionSource,
}

impl Resolution {
    fn signature(name: &'static str, plan: Vec<Subtask>) -> Self {
        Self {
            plan,
            source: ResolutionSource::KnownSignature(name),
        }
    }

    fn human(problem: impl Into<String>) -> Self {
        Self {
            plan: vec![Subtask::new(HUMAN_INTERVENTION, problem)],
            source: ResolutionSource::HumanIntervention,
        }
    }
}

/// 根因分类阶段的 JSON 契约
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCause {
    #[serde(default = "unknown")]
    pub category: String,
    #[serde(default)]
    pub root_cause: String,
}

/// 修复策略阶段的 JSON 契约
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStrategy {
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

fn unknown() -> String {
    "unknown".to_string()
}

pub struct ErrorResolver {
    llm: Arc<dyn LlmClient>,
    guard: ResolverGuard,
    history_window: usize,
}

impl ErrorResolver {
    pub fn new(llm: Arc<dyn LlmClient>, guard: ResolverGuard, history_window: usize) -> Self {
        Self {
            llm,
            guard,
            history_window,
        }
    }

    pub async fn resolve(&self, snapshot: &StateSnapshot) -> Resolution {
        if let Some(reason) = self.guard.check(snapshot) {
            return self.guarded(snapshot, &reason);
        }

        if let Some(resolution) = match_known_signature(snapshot) {
            tracing::info!(source = %resolution.source, steps = resolution.plan.len(), "resolved from known error signature");
            return resolution;
        }

        self.generate(snapshot).await
    }

    fn guarded(&self, snapshot: &StateSnapshot, reason: &str) -> Resolution {
        let already_fell_back = snapshot
            .history
            .iter()
            .any(|h| h.starts_with(&format!("Recovery plan ({FALLBACK_LABEL})")));
        if already_fell_back {
            tracing::warn!(reason, "loop guard tripped again after a fallback plan, escalating");
            return Resolution::human(format!(
                "The system keeps failing on this task ({reason}) even after a fallback plan. Last error: {}",
                snapshot.last_execution_error.as_deref().unwrap_or("unknown")
            ));
        }
        tracing::warn!(reason, "loop guard tripped, using keyword fallback plan");
        Resolution {
            plan: fallback_plan(&snapshot.original_task),
            source: ResolutionSource::Fallback,
        }
    }

    /// 三段流水线：根因 → 策略 → 计划
    async fn generate(&self, snapshot: &StateSnapshot) -> Resolution {
        let context = self.error_context(snapshot);
        let error = snapshot.last_execution_error.as_deref().unwrap_or("unknown error");

        let root_cause = self
            .ask(ROOT_CAUSE_SYSTEM, &context)
            .await
            .and_then(|raw| extract_json_object::<RootCause>(&raw))
            .filter(|rc| !rc.root_cause.trim().is_empty())
            .unwrap_or_else(|| RootCause {
                category: unknown(),
                root_cause: error.to_string(),
            });
        tracing::info!(category = %root_cause.category, root_cause = %root_cause.root_cause, "resolver root cause");

        let strategy_request = format!(
            "{context}\n\nRoot cause ({}): {}\n\nPropose a fix strategy.",
            root_cause.category, root_cause.root_cause
        );
        let strategy = self
            .ask(STRATEGY_SYSTEM, &strategy_request)
            .await
            .and_then(|raw| extract_json_object::<FixStrategy>(&raw))
            .unwrap_or_else(|| FixStrategy {
                strategy: format!("Address the root cause: {}", root_cause.root_cause),
                steps: Vec::new(),
            });

        let steps = strategy
            .steps
            .iter()
            .map(|s| format!("  - {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        let plan_request = format!(
            "{context}\n\nRoot cause: {}\nFix strategy: {}\nSteps:\n{steps}\n\nCreate the fix plan as a JSON array.",
            root_cause.root_cause, strategy.strategy
        );
        let plan: Vec<Subtask> = match self.ask(PLAN_SYSTEM, &plan_request).await {
            Some(raw) => extract_plan(&raw)
                .into_plan()
                .unwrap_or_default()
                .into_iter()
                .filter(Subtask::is_well_formed)
                .collect(),
            None => Vec::new(),
        };

        if plan.is_empty() {
            tracing::warn!("resolver pipeline produced no plan, requesting human intervention");
            return Resolution::human(format!(
                "Automatic error resolution failed. Root cause ({}): {}",
                root_cause.category, root_cause.root_cause
            ));
        }
        tracing::info!(steps = plan.len(), "resolver generated a fix plan");
        Resolution {
            plan,
            source: ResolutionSource::Generated,
        }
    }

    async fn ask(&self, system: &str, request: &str) -> Option<String> {
        let messages = [Message::system(system), Message::user(request)];
        match self.llm.complete(&messages).await {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::warn!(error = %e, "resolver generator call failed");
                None
            }
        }
    }

    fn error_context(&self, snapshot: &StateSnapshot) -> String {
        let history = snapshot
            .recent_history(self.history_window)
            .iter()
            .map(|h| format!("  - {h}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Error Context:\n\
             - Original Task: {}\n\
             - Failed Step: {}\n\
             - Last Error Message: {}\n\
             - Last Output: {}\n\
             - Project Directory: {}\n\
             - History (last {} actions):\n{history}",
            snapshot.original_task,
            snapshot
                .last_subtask
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "None".to_string()),
            snapshot.last_execution_error.as_deref().unwrap_or("None"),
            snapshot.last_execution_output.as_deref().unwrap_or("None"),
            snapshot.project_directory.as_deref().unwrap_or("Not created yet."),
            self.history_window,
        )
    }
}

/// 关键词兜底计划：web / node / 默认 python
pub fn fallback_plan(task: &str) -> Vec<Subtask> {
    let lower = task.to_lowercase();
    let (structure, target) = if WEB_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (
            Command::CreateStandardStructure("web_project".to_string()),
            "index.html",
        )
    } else if NODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (
            Command::CreateStandardStructure("node_project".to_string()),
            "index.js",
        )
    } else {
        (Command::CreateStructure, "main.py")
    };

    vec![
        Subtask::new(FILE_AGENT, structure.to_string()),
        Subtask::new(
            CODER_AGENT,
            format!("Generate code for '{target}' that implements: {task}"),
        ),
        Subtask::new(FILE_AGENT, Command::SaveCode(target.to_string()).to_string()),
    ]
}

/// 已知错误特征表；按顺序匹配，命中即返回
fn match_known_signature(snapshot: &StateSnapshot) -> Option<Resolution> {
    let error = snapshot.last_execution_error.as_deref()?;
    let lower = error.to_lowercase();
    let retry = snapshot.last_subtask.clone();

    if lower.contains("human_intervention_required") {
        return Some(Resolution {
            source: ResolutionSource::KnownSignature("interactive prompt"),
            ..Resolution::human(error.to_string())
        });
    }

    if lower.contains("permission denied") {
        let dir = snapshot.project_directory.as_deref().unwrap_or(".");
        let failed = retry
            .as_ref()
            .map(|s| s.description.clone())
            .unwrap_or_else(|| "the last step".to_string());
        return Some(Resolution::signature(
            "permission denied",
            vec![
                Subtask::new(SHELL_AGENT, format!("ls -la '{dir}'")),
                Subtask::new(
                    HUMAN_INTERVENTION,
                    format!(
                        "Permission denied while running '{failed}'. The system will not change permissions. \
                         Fix the permissions of '{dir}' manually, then restart the task."
                    ),
                ),
            ],
        ));
    }

    let missing_tool = command_not_found_res()
        .iter()
        .find_map(|re| re.captures(error).and_then(|c| c.get(1)))
        .map(|m| m.as_str().to_string());
    if let Some(tool) = missing_tool {
        return Some(resolve_missing_tool(&tool, retry.as_ref()));
    }

    if lower.contains("package.json") {
        return Some(Resolution::signature(
            "missing package.json",
            with_retry(Subtask::new(SHELL_AGENT, "npm init -y"), retry),
        ));
    }
    if lower.contains("cargo.toml") {
        return Some(Resolution::signature(
            "missing Cargo.toml",
            with_retry(Subtask::new(SHELL_AGENT, "cargo init"), retry),
        ));
    }

    if let Some(module) = no_module_re().captures(error).and_then(|c| c.get(1)) {
        let package = module.as_str().split('.').next().unwrap_or(module.as_str());
        return Some(Resolution::signature(
            "missing python module",
            with_retry(Subtask::new(SHELL_AGENT, format!("pip install {package}")), retry),
        ));
    }
    if let Some(module) = cannot_find_module_re().captures(error).and_then(|c| c.get(1)) {
        let module = module.as_str();
        if !module.starts_with('.') && !module.starts_with('/') {
            return Some(Resolution::signature(
                "missing node module",
                with_retry(Subtask::new(SHELL_AGENT, format!("npm install {module}")), retry),
            ));
        }
    }

    if lower.contains("no such file or directory") {
        if snapshot.project_directory.is_none() {
            return Some(Resolution::signature(
                "missing directory",
                with_retry(
                    Subtask::new(FILE_AGENT, Command::CreateStructure.to_string()),
                    retry,
                ),
            ));
        }
        if let Some(dir) = missing_directory(error) {
            return Some(Resolution::signature(
                "missing directory",
                with_retry(Subtask::new(SHELL_AGENT, format!("mkdir -p '{dir}'")), retry),
            ));
        }
    }

    None
}

/// command not found：已知替代工具改写上一条 shell 命令，否则请求人工安装
fn resolve_missing_tool(tool: &str, retry: Option<&Subtask>) -> Resolution {
    let alternative = match tool {
        "wget" => Some("curl -L -O"),
        "python" => Some("python3"),
        "pip" => Some("pip3"),
        _ => None,
    };

    let rewritten = alternative.zip(retry.filter(|s| s.agent == SHELL_AGENT)).and_then(
        |(replacement, last)| {
            let re = Regex::new(&format!(r"\b{}\b", regex::escape(tool))).ok()?;
            let rewritten = re.replace_all(&last.description, replacement).into_owned();
            (rewritten != last.description).then_some(rewritten)
        },
    );

    match rewritten {
        Some(command) => Resolution::signature("command not found", vec![Subtask::new(SHELL_AGENT, command)]),
        None => Resolution {
            source: ResolutionSource::KnownSignature("command not found"),
            ..Resolution::human(format!(
                "The required tool '{tool}' is not installed (command not found). Install it, then restart the task."
            ))
        },
    }
}

fn with_retry(fix: Subtask, retry: Option<Subtask>) -> Vec<Subtask> {
    std::iter::once(fix).chain(retry).collect()
}

/// 从错误文本中取出缺失路径；像文件的路径取其父目录
fn missing_directory(error: &str) -> Option<String> {
    let caps = missing_path_re().captures(error)?;
    let raw = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?.as_str();
    let path = Path::new(raw);
    let dir = if path.extension().is_some() {
        path.parent()?
    } else {
        path
    };
    let dir = dir.to_string_lossy().to_string();
    (!dir.is_empty()).then_some(dir)
}
