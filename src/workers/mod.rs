//! Worker 层：注册表、带超时与审计的派发器，以及各角色 Worker（file / shell / coder / search）

pub mod coder;
pub mod executor;
pub mod file;
pub mod registry;
pub mod search;
pub mod shell;

pub use coder::CoderWorker;
pub use executor::WorkerDispatcher;
pub use file::FileWorker;
pub use registry::{Worker, WorkerError, WorkerOutput, WorkerRegistry};
pub use search::SearchWorker;
pub use shell::ShellWorker;

pub const FILE_AGENT: &str = "file_agent";
pub const SHELL_AGENT: &str = "shell_agent";
pub const CODER_AGENT: &str = "coder_agent";
pub const SEARCH_AGENT: &str = "search_agent";
