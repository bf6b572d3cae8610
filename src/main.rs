//! Ultron 命令行入口
//!
//! 用法：`ultron [--config <path>] [--require <tool>]... [--document <path>] <task...>`
//! 运行结束后把最终上下文以 JSON 打印到 stdout；运行失败时退出码为 1。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ultron::config::{load_config, AppConfig};
use ultron::core::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "ultron")]
#[command(about = "Multi-agent task orchestrator: plan, execute, recover")]
#[command(version)]
struct Cli {
    /// Extra config file layered over config/default.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Tool that must be on PATH before the run starts (repeatable)
    #[arg(long = "require", value_name = "TOOL")]
    required_tools: Vec<String>,

    /// Plain-text document loaded into memory before planning
    #[arg(long, value_name = "PATH")]
    document: Option<PathBuf>,

    /// Task description
    #[arg(required = true, num_args = 1..)]
    task: Vec<String>,
}

impl Cli {
    fn task(&self) -> String {
        self.task.join(" ")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ultron::observability::init();

    let args = Cli::parse();

    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let document = match &args.document {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read document {}", path.display()))?,
        ),
        None => None,
    };

    let orchestrator = Orchestrator::from_config(&cfg).context("Failed to create orchestrator")?;
    let report = orchestrator
        .execute_task_with_document(&args.task(), &args.required_tools, document)
        .await;

    if let Some(message) = &report.intervention {
        eprintln!("{message}");
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize run report")?
    );

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_collects_flags_and_task_words() {
        let cli = Cli::try_parse_from([
            "ultron",
            "--require",
            "git",
            "--require",
            "python3",
            "--document",
            "notes.txt",
            "build",
            "a",
            "calculator",
        ])
        .unwrap();
        assert_eq!(cli.required_tools, vec!["git".to_string(), "python3".to_string()]);
        assert_eq!(cli.document, Some(PathBuf::from("notes.txt")));
        assert!(cli.config.is_none());
        assert_eq!(cli.task(), "build a calculator");
    }

    #[test]
    fn test_cli_requires_task() {
        assert!(Cli::try_parse_from(["ultron", "--require", "git"]).is_err());
        assert!(Cli::try_parse_from(["ultron", "--document"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
