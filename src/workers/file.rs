//! 文件 Worker：确定性的文件操作，不调用生成器
//!
//! 支持 CREATE PROJECT STRUCTURE / CREATE STANDARD STRUCTURE / CREATE EMPTY FILE / SAVE CODE TO / READ FILE。
//! 所有目标路径经 resolve_in 校验必须落在项目目录内（禁止 ../ 与绝对路径逃逸）。
//! Worker 不写 SharedState：新建的项目目录、文件、读到的内容都通过 WorkerOutput 返回。

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::core::{Command, SharedState};
use crate::workers::{Worker, WorkerError, WorkerOutput, FILE_AGENT};

const DEFAULT_PROJECT: &str = "default-project";
const NEW_PROJECT: &str = "new-project";

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("valid regex"))
}

/// 项目名：任务小写后取前三个纯字母数字单词，以 `-` 连接
pub fn project_name(task: &str) -> String {
    let words: Vec<String> = task
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().all(char::is_alphanumeric))
        .take(3)
        .map(String::from)
        .collect();
    if words.is_empty() {
        NEW_PROJECT.to_string()
    } else {
        words.join("-")
    }
}

/// 任务文本中指向已存在目录的片段（先看引号内，再看空白分隔的词）
///
/// 含路径分隔符的片段至少要有一个普通路径分量，且不能是文件系统根或当前目录；
/// 其余只在 projects_root 下查找，避免普通单词误命中当前目录。
pub fn detect_existing_project(task: &str, projects_root: &Path) -> Option<PathBuf> {
    let quoted = quoted_re()
        .captures_iter(task)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()));
    let bare = task.split_whitespace().map(|t| {
        t.trim_matches(|c: char| matches!(c, '\'' | '"' | '(' | ')'))
            .trim_end_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '!' | '?'))
            .to_string()
    });

    quoted
        .chain(bare)
        .filter(|t| !t.is_empty())
        .find_map(|token| {
            if token.contains('/') || token.contains('\\') {
                existing_path_token(&token)
            } else if is_plain_name(&token) {
                let candidate = projects_root.join(&token);
                candidate.is_dir().then(|| candidate.canonicalize().unwrap_or(candidate))
            } else {
                None
            }
        })
}

/// 单个普通分量（排除 `.`、`..` 等）
fn is_plain_name(token: &str) -> bool {
    let mut components = Path::new(token).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn existing_path_token(token: &str) -> Option<PathBuf> {
    let path = Path::new(token);
    if !path.components().any(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    let canonical = path.canonicalize().ok()?;
    if !canonical.is_dir() || canonical.parent().is_none() {
        return None;
    }
    let cwd = std::env::current_dir().and_then(|d| d.canonicalize()).ok();
    (cwd.as_deref() != Some(canonical.as_path())).then_some(canonical)
}

/// 标准结构模板：相对路径 + 初始内容
fn template_files(kind: &str, project: &str) -> Option<Vec<(&'static str, String)>> {
    let files = match kind {
        "web_project" => vec![
            (
                "index.html",
                format!(
                    "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n  <meta charset=\"UTF-8\">\n  <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n  <title>{project}</title>\n  <link rel=\"stylesheet\" href=\"styles.css\">\n</head>\n<body>\n  <script src=\"script.js\"></script>\n</body>\n</html>\n"
                ),
            ),
            ("styles.css", String::new()),
            ("script.js", String::new()),
        ],
        "python_package" => vec![
            ("src/__init__.py", String::new()),
            ("tests/__init__.py", String::new()),
            ("requirements.txt", String::new()),
            ("README.md", format!("# {project}\n")),
        ],
        "node_project" => vec![
            (
                "package.json",
                format!(
                    "{{\n  \"name\": \"{project}\",\n  \"version\": \"1.0.0\",\n  \"main\": \"index.js\",\n  \"scripts\": {{\n    \"start\": \"node index.js\"\n  }}\n}}\n"
                ),
            ),
            ("index.js", String::new()),
            ("README.md", format!("# {project}\n")),
        ],
        _ => return None,
    };
    Some(files)
}

/// 在 dir 下解析相对路径；只接受普通路径分量
fn resolve_in(dir: &Path, relative: &str) -> Result<PathBuf, WorkerError> {
    let path = Path::new(relative);
    let only_normal = path.components().all(|c| matches!(c, Component::Normal(_)));
    if relative.is_empty() || !only_normal {
        return Err(WorkerError::Failed(format!(
            "Access denied: path '{relative}' is outside the project directory"
        )));
    }
    Ok(dir.join(path))
}

/// SAVE CODE 的代码来源：精确键 → 唯一同名文件 → 唯一同扩展名；否则报错
fn resolve_code<'a>(generated: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str, WorkerError> {
    if let Some(code) = generated.get(name) {
        return Ok(code);
    }

    let target = Path::new(name);
    let same_name: Vec<_> = generated
        .iter()
        .filter(|(key, _)| Path::new(key).file_name() == target.file_name())
        .collect();
    if same_name.len() == 1 {
        let (key, code) = same_name[0];
        tracing::info!(key = %key, target = %name, "using generated code stored under matching file name");
        return Ok(code.as_str());
    }

    let Some(ext) = target.extension() else {
        return Err(WorkerError::Failed(format!("No generated code found for '{name}'.")));
    };
    let same_ext: Vec<_> = generated
        .iter()
        .filter(|(key, _)| Path::new(key).extension() == Some(ext))
        .collect();
    match same_ext.len() {
        0 => Err(WorkerError::Failed(format!("No generated code found for '{name}'."))),
        1 => {
            let (key, code) = same_ext[0];
            tracing::info!(key = %key, target = %name, "using generated code with matching extension");
            Ok(code.as_str())
        }
        _ => Err(WorkerError::Failed(format!(
            "Generated code for '{name}' is ambiguous, candidates: {}",
            same_ext.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> WorkerError {
    WorkerError::Failed(format!("Failed to {action} '{}': {e}", path.display()))
}

/// 文件 Worker：绑定 projects_root
pub struct FileWorker {
    projects_root: PathBuf,
}

impl FileWorker {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    /// 相对根目录按当前工作目录展开，便于 history 与 shell 使用
    fn projects_root(&self) -> PathBuf {
        if self.projects_root.is_absolute() {
            return self.projects_root.clone();
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(&self.projects_root))
            .unwrap_or_else(|_| self.projects_root.clone())
    }

    /// 写文件的目标目录；未设置项目目录时使用 default-project，并在第二个返回值中标明
    async fn target_directory(&self, state: &SharedState) -> Result<(PathBuf, bool), WorkerError> {
        if let Some(dir) = state.project_directory() {
            return Ok((dir.to_path_buf(), false));
        }
        let dir = self.projects_root().join(DEFAULT_PROJECT);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create directory", &dir, e))?;
        tracing::info!(dir = %dir.display(), "project directory was not set, using default project");
        Ok((dir, true))
    }

    async fn create_structure(&self, state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        if let Some(dir) = state.project_directory() {
            return Ok(WorkerOutput::message(format!(
                "Using existing project directory '{}'.",
                dir.display()
            )));
        }
        let name = project_name(state.original_task());
        let dir = self.projects_root().join(&name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create directory", &dir, e))?;
        tracing::info!(dir = %dir.display(), "project directory created");
        Ok(WorkerOutput::message(format!("Project directory '{name}' created.")).with_project_directory(dir))
    }

    async fn create_standard_structure(
        &self,
        kind: &str,
        state: &SharedState,
    ) -> Result<WorkerOutput, WorkerError> {
        let name = project_name(state.original_task());
        let files = template_files(kind, &name).ok_or_else(|| {
            WorkerError::Failed(format!(
                "Unknown project template '{kind}' (available: web_project, python_package, node_project)"
            ))
        })?;

        let (dir, is_new) = match state.project_directory() {
            Some(dir) => (dir.to_path_buf(), false),
            None => (self.projects_root().join(&name), true),
        };

        let mut output = WorkerOutput::default();
        for (relative, content) in files {
            let path = resolve_in(&dir, relative)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create directory", parent, e))?;
            }
            // 已有文件保留原内容
            if !path.exists() {
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| io_error("write", &path, e))?;
            }
            output = output.with_created_file(path.display().to_string());
        }

        output.output = Some(format!(
            "Standard structure '{kind}' created with {} files.",
            output.created_files.len()
        ));
        if is_new {
            output = output.with_project_directory(dir);
        }
        Ok(output)
    }

    async fn write_file(&self, name: &str, content: &str, state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        let (dir, is_default) = self.target_directory(state).await?;
        let path = resolve_in(&dir, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory", parent, e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| io_error("write", &path, e))?;
        tracing::info!(path = %path.display(), bytes = content.len(), "file written");

        let mut output = WorkerOutput::message(format!("File '{name}' saved successfully."))
            .with_created_file(path.display().to_string());
        if is_default {
            output = output.with_project_directory(dir);
        }
        Ok(output)
    }

    async fn read_file(&self, name: &str, state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        let dir = state.project_directory().ok_or_else(|| {
            WorkerError::Failed(format!("Cannot read '{name}': no project directory is set."))
        })?;
        let path = resolve_in(dir, name)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("read", &path, e))?;
        Ok(WorkerOutput::message(format!(
            "File '{name}' read ({} chars).",
            content.chars().count()
        ))
        .with_code(name, content))
    }
}

#[async_trait]
impl Worker for FileWorker {
    fn name(&self) -> &str {
        FILE_AGENT
    }

    fn description(&self) -> &str {
        "Deterministic file operations: CREATE PROJECT STRUCTURE, CREATE STANDARD STRUCTURE <web_project|python_package|node_project>, CREATE EMPTY FILE 'name', SAVE CODE TO 'name', READ FILE 'name'."
    }

    async fn run(&self, command: &Command, state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        tracing::info!(command = %command, "file worker");
        match command {
            Command::CreateStructure => self.create_structure(state).await,
            Command::CreateStandardStructure(kind) => self.create_standard_structure(kind, state).await,
            Command::CreateEmptyFile(name) => self.write_file(name, "", state).await,
            Command::SaveCode(name) => {
                let code = resolve_code(state.generated_code(), name)?;
                self.write_file(name, code, state).await
            }
            Command::ReadFile(name) => self.read_file(name, state).await,
            Command::Opaque(text) => Err(WorkerError::Unsupported {
                worker: FILE_AGENT.to_string(),
                command: text.clone(),
            }),
        }
    }
}
