//! 核心编排层：共享状态、命令语言、错误类型、预检、人工介入与主控循环

pub mod command;
pub mod error;
pub mod intervention;
pub mod orchestrator;
pub mod preflight;
pub mod state;

pub use command::{extract_quoted_filename, Command};
pub use error::{CommandError, OrchestratorError};
pub use intervention::{render_help_request, HUMAN_INTERVENTION};
pub use orchestrator::{create_llm_from_config, default_registry, Orchestrator, RunReport};
pub use preflight::{check_dependencies, missing_tools, ToolProbe, WhichProbe};
pub use state::{SharedState, StateSnapshot, Subtask, TaskStatus};
