//! Shell Worker：在伪终端中执行命令，检测交互式提示
//!
//! 命令先经禁止子串检查（rm -rf /、mkfs、fork bomb 等），再通过 sh -c / cmd /C 在伪终端中运行，
//! 工作目录为项目目录（未设置时为当前目录）。输出由读线程送回，主循环按 100ms 轮询：
//! - 输出中出现密码 / 确认类提示 → 立即终止子进程，返回 InteractivePrompt（从不自动应答）
//! - 超过 command_timeout_secs → 终止子进程，返回 Timeout
//! - 非零退出码 → Failed，错误内容即命令输出（供 ErrorResolver 匹配错误特征）

use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtySize};

use crate::core::{Command, SharedState};
use crate::workers::{Worker, WorkerError, WorkerOutput, SHELL_AGENT};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 默认禁止的子串
pub fn default_forbidden_patterns() -> Vec<String> {
    [
        "rm -rf /",
        "rm -fr /",
        "rm -rf ~",
        "mkfs",
        "dd if=",
        "> /dev/sd",
        "chmod -r 777 /",
        "curl | sh",
        "wget | sh",
        ":(){ :|:& };:", // fork bomb
        "shutdown",
        "reboot",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// 默认交互提示特征（小写匹配）
pub fn default_prompt_patterns() -> Vec<String> {
    [
        "password:",
        "passphrase",
        "continue? (y/n)",
        "[y/n]",
        "(yes/no)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Shell Worker：禁止子串 + 伪终端执行 + 超时
pub struct ShellWorker {
    timeout_secs: u64,
    prompt_patterns: Vec<String>,
    forbidden_patterns: Vec<String>,
}

impl Default for ShellWorker {
    fn default() -> Self {
        Self::new(60, default_prompt_patterns(), default_forbidden_patterns())
    }
}

impl ShellWorker {
    pub fn new(timeout_secs: u64, prompt_patterns: Vec<String>, forbidden_patterns: Vec<String>) -> Self {
        Self {
            timeout_secs,
            prompt_patterns: prompt_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
            forbidden_patterns: forbidden_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    fn check_allowed(&self, command: &str) -> Result<(), WorkerError> {
        if command.trim().is_empty() {
            return Err(WorkerError::Failed("Empty shell command".to_string()));
        }
        let lower = command.to_lowercase();
        match self.forbidden_patterns.iter().find(|p| lower.contains(p.as_str())) {
            Some(pattern) => Err(WorkerError::Failed(format!(
                "Command rejected, forbidden pattern: {pattern}"
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Worker for ShellWorker {
    fn name(&self) -> &str {
        SHELL_AGENT
    }

    fn description(&self) -> &str {
        "Runs one shell command verbatim in the project directory (e.g. 'pip3 install flask', 'python3 main.py'). Interactive commands are refused."
    }

    async fn run(&self, command: &Command, state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        let Command::Opaque(raw) = command else {
            return Err(WorkerError::Unsupported {
                worker: SHELL_AGENT.to_string(),
                command: command.to_string(),
            });
        };
        self.check_allowed(raw)?;

        let cwd = match state.project_directory() {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()
                .map_err(|e| WorkerError::Failed(format!("Cannot determine working directory: {e}")))?,
        };
        tracing::info!(command = %raw, cwd = %cwd.display(), "shell worker execute");

        let job = PtyJob {
            command: raw.clone(),
            cwd,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            prompt_patterns: self.prompt_patterns.clone(),
        };
        let output = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| WorkerError::Failed(format!("Shell task panicked: {e}")))??;

        Ok(WorkerOutput::message(output))
    }
}

/// 一次伪终端执行（在阻塞线程池中运行）
struct PtyJob {
    command: String,
    cwd: PathBuf,
    timeout: Duration,
    prompt_patterns: Vec<String>,
}

impl PtyJob {
    fn run(self) -> Result<String, WorkerError> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| failed("Failed to open pseudo-terminal", e))?;

        let mut builder = if cfg!(target_os = "windows") {
            let mut b = CommandBuilder::new("cmd");
            b.args(["/C", self.command.as_str()]);
            b
        } else {
            let mut b = CommandBuilder::new("sh");
            b.args(["-c", self.command.as_str()]);
            b
        };
        builder.cwd(&self.cwd);

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| failed("Failed to spawn command", e))?;
        // 只保留 master 端，子进程退出后读端才能收到 EOF
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| failed("Failed to read pseudo-terminal", e))?;
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let deadline = Instant::now() + self.timeout;
        let mut output = String::new();
        let status = loop {
            if Instant::now() >= deadline {
                kill(child.as_mut());
                return Err(WorkerError::Timeout {
                    worker: SHELL_AGENT.to_string(),
                    secs: self.timeout.as_secs(),
                });
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => {
                    output.push_str(&String::from_utf8_lossy(&chunk));
                    if self.waiting_for_input(&output) {
                        kill(child.as_mut());
                        tracing::warn!(command = %self.command, "interactive prompt detected, process terminated");
                        return Err(WorkerError::InteractivePrompt {
                            command: self.command.clone(),
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(status) = child.try_wait().map_err(|e| failed("Failed to poll process", e))? {
                        // 退出后把剩余输出读完
                        while let Ok(chunk) = rx.recv_timeout(POLL_INTERVAL) {
                            output.push_str(&String::from_utf8_lossy(&chunk));
                        }
                        break status;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break child.wait().map_err(|e| failed("Failed to wait for process", e))?;
                }
            }
        };
        drop(pair.master);

        let output = output.replace("\r\n", "\n").trim().to_string();
        if status.success() {
            tracing::info!(command = %self.command, "shell command succeeded");
            Ok(output)
        } else {
            tracing::info!(command = %self.command, code = status.exit_code(), "shell command failed");
            Err(WorkerError::Failed(if output.is_empty() {
                format!("Command '{}' exited with code {}", self.command, status.exit_code())
            } else {
                output
            }))
        }
    }

    /// 只看输出尾部，避免早先回显的文字反复命中
    fn waiting_for_input(&self, output: &str) -> bool {
        let tail: String = output
            .chars()
            .rev()
            .take(256)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let tail = tail.to_lowercase();
        self.prompt_patterns.iter().any(|p| tail.contains(p.as_str()))
    }
}

fn failed(what: &str, e: impl std::fmt::Display) -> WorkerError {
    WorkerError::Failed(format!("{what}: {e}"))
}

fn kill(child: &mut (dyn Child + Send + Sync)) {
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, "failed to kill child process");
    }
    let _ = child.try_wait();
}
