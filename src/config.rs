//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ULTRON__*` 覆盖（双下划线表示嵌套，如 `ULTRON__LLM__PROVIDER=openai`）。
//! 每个段都有手写的 Default，缺失的段与键取真实默认值。

use std::path::PathBuf;

use serde::Deserialize;

use crate::workers::search::DEFAULT_SEARCH_ENDPOINT;
use crate::workers::shell::{default_forbidden_patterns, default_prompt_patterns};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub planner: PlannerSection,
    pub resolver: ResolverSection,
    pub workers: WorkersSection,
}

/// [app] 段：项目根目录、循环次数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 新项目目录创建在此目录下
    pub projects_root: PathBuf,
    /// 主循环迭代上限，超过即以 failed 结束
    pub max_iterations: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("./projects"),
            max_iterations: 500,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub deepseek: LlmDeepSeekSection,
    pub openai: LlmOpenAiSection,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            deepseek: LlmDeepSeekSection::default(),
            openai: LlmOpenAiSection::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次生成请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 120 }
    }
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 提示词中附带的最近 history 条数
    pub history_window: usize,
    /// 一次运行最多安装的计划批次；达到后计划耗尽即 completed
    pub max_rounds: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            history_window: 5,
            max_rounds: 10,
        }
    }
}

/// [resolver] 段：循环保护阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub max_history: usize,
    pub error_window: usize,
    pub error_threshold: usize,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            max_history: 20,
            error_window: 5,
            error_threshold: 3,
        }
    }
}

/// [workers] 段：派发超时与各 Worker 子段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// 单次 Worker 调用的总超时（秒），包括生成器调用
    pub dispatch_timeout_secs: u64,
    pub shell: ShellSection,
    pub coder: CoderSection,
    pub search: SearchSection,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            dispatch_timeout_secs: 600,
            shell: ShellSection::default(),
            coder: CoderSection::default(),
            search: SearchSection::default(),
        }
    }
}

/// [workers.shell] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub command_timeout_secs: u64,
    /// 视为「等待交互输入」的输出片段（小写匹配）
    pub prompt_patterns: Vec<String>,
    /// 命令中出现即拒绝执行的子串
    pub forbidden_patterns: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            prompt_patterns: default_prompt_patterns(),
            forbidden_patterns: default_forbidden_patterns(),
        }
    }
}

/// [workers.coder] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoderSection {
    /// 是否执行评审 / 重构两步
    pub review: bool,
    /// 附带的源文档最大字符数
    pub max_document_chars: usize,
}

impl Default for CoderSection {
    fn default() -> Self {
        Self {
            review: true,
            max_document_chars: 12_000,
        }
    }
}

/// [workers.search] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub max_result_chars: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
            timeout_secs: 15,
            max_result_chars: 8000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ULTRON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ULTRON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ULTRON")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
