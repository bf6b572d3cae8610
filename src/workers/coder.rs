//! Coder Worker：草稿 → 评审 → 重构 三步生成代码
//!
//! 每一步都是一次独立的生成器调用；代码取 <<START_CODE>> / <<END_CODE>> 之间的内容，
//! 其次取第一个 markdown 代码块，最后退回整段文本。评审回复 "No issues found" 时跳过重构。

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::core::{extract_quoted_filename, Command, SharedState};
use crate::llm::{LlmClient, Message};
use crate::planning::strip_think_blocks;
use crate::workers::{Worker, WorkerError, WorkerOutput, CODER_AGENT};

const START_MARKER: &str = "<<START_CODE>>";
const END_MARKER: &str = "<<END_CODE>>";
const UNKNOWN_FILE: &str = "unknown_file.txt";
const NO_ISSUES: &str = "no issues found";

const DRAFT_SYSTEM: &str = "You are a senior developer focused on rapid prototyping. You write functional code to meet the user's request. \
Your output MUST be ONLY the raw code, wrapped in <<START_CODE>> and <<END_CODE>> markers. Do not add any explanations or thoughts.";

const REVIEW_SYSTEM: &str = "You are a meticulous code reviewer. Analyze the provided code for bugs, security vulnerabilities, and deviations from best practices. \
Provide a concise, bulleted list of necessary improvements. If the code is correct, respond with exactly 'No issues found.'";

const REFACTOR_SYSTEM: &str = "You are a senior software architect specializing in clean code. Rewrite the provided code draft to incorporate the reviewer's feedback. \
Output ONLY the final, raw code, wrapped in <<START_CODE>> and <<END_CODE>> markers.";

const HTML_REQUIREMENTS: &str = "\n---\nHTML structure requirements:\n\
Your response MUST be a complete HTML5 document. It MUST include:\n\
- A `<!DOCTYPE html>` declaration.\n\
- An `<html>` tag with the `lang=\"en\"` attribute.\n\
- A `<head>` with `<meta charset=\"UTF-8\">`, `<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">`, a relevant `<title>` and `<link rel=\"stylesheet\" href=\"styles.css\">`.\n\
- A `<body>` with the main content and `<script src=\"script.js\"></script>` right before `</body>`.\n\
Remember to wrap the final code in the markers.";

fn for_quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\bfor\s+['"]([\w.\-]+)['"]"#).expect("valid regex"))
}

fn for_bare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bfor\s+([\w\-]+\.[A-Za-z0-9]+)\b").expect("valid regex"))
}

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[\w+\-]*[^\n]*\n(.*?)```").expect("valid regex"))
}

/// 目标文件名：`for 'x'` → `for x.ext` → 第一个引号片段 → unknown_file.txt
pub fn target_filename(request: &str) -> String {
    for_quoted_re()
        .captures(request)
        .or_else(|| for_bare_re().captures(request))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| extract_quoted_filename(request))
        .unwrap_or_else(|| UNKNOWN_FILE.to_string())
}

/// 取标记之间的代码；其次代码块；最后整段文本
pub fn extract_code(raw: &str) -> String {
    let text = strip_think_blocks(raw);
    if let Some(start) = text.find(START_MARKER) {
        let body = &text[start + START_MARKER.len()..];
        if let Some(end) = body.find(END_MARKER) {
            return body[..end].trim().to_string();
        }
    }
    if let Some(code) = fenced_re().captures(&text).and_then(|c| c.get(1)) {
        return code.as_str().trim().to_string();
    }
    tracing::warn!("no code markers found, using raw generator output");
    text.trim().to_string()
}

pub struct CoderWorker {
    llm: Arc<dyn LlmClient>,
    review: bool,
    max_document_chars: usize,
}

impl CoderWorker {
    pub fn new(llm: Arc<dyn LlmClient>, review: bool, max_document_chars: usize) -> Self {
        Self {
            llm,
            review,
            max_document_chars,
        }
    }

    async fn ask(&self, system: &str, request: String) -> Result<String, WorkerError> {
        self.llm
            .complete(&[Message::system(system), Message::user(request)])
            .await
            .map_err(|e| WorkerError::Failed(format!("LLM error: {e}")))
    }

    fn contextual_request(&self, request: &str, filename: &str, state: &SharedState) -> String {
        let mut prompt = format!(
            "Based on the following project context, write the required code for the file: `{filename}`\n\n\
             Project Context:\n\
             - Original Task: {}\n\
             - Project Directory: {}\n\n\
             Current Coding Task:\n{request}\n",
            state.original_task(),
            state
                .project_directory()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "Not created yet.".to_string()),
        );

        if let Some(existing) = state.generated_code().get(filename) {
            prompt.push_str(&format!(
                "\nCurrent content of `{filename}` (modify it, keep what still applies):\n{existing}\n"
            ));
        }
        if let Some(document) = state.document_content() {
            let truncated: String = document.chars().take(self.max_document_chars).collect();
            prompt.push_str(&format!("\nSource document:\n{truncated}\n"));
        }
        if filename.ends_with(".html") || filename.ends_with(".htm") {
            prompt.push_str(HTML_REQUIREMENTS);
        }
        prompt
    }
}

#[async_trait]
impl Worker for CoderWorker {
    fn name(&self) -> &str {
        CODER_AGENT
    }

    fn description(&self) -> &str {
        "Generates or modifies the code of one file from a natural-language request such as \"Generate code for 'main.py' that ...\". The code is kept in memory until SAVE CODE TO."
    }

    async fn run(&self, command: &Command, state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        let Command::Opaque(request) = command else {
            return Err(WorkerError::Unsupported {
                worker: CODER_AGENT.to_string(),
                command: command.to_string(),
            });
        };
        let filename = target_filename(request);

        tracing::info!(file = %filename, "coder: drafting");
        let draft = extract_code(
            &self
                .ask(DRAFT_SYSTEM, self.contextual_request(request, &filename, state))
                .await?,
        );
        if draft.is_empty() {
            return Err(WorkerError::Failed(format!(
                "Drafting step produced no code for '{filename}'."
            )));
        }
        if !self.review {
            return Ok(WorkerOutput::message(format!("Code generated for {filename}.")).with_code(filename, draft));
        }

        tracing::info!(file = %filename, "coder: reviewing");
        let feedback = self
            .ask(
                REVIEW_SYSTEM,
                format!("Please review the following code for the file '{filename}':\n\n{draft}"),
            )
            .await?;
        let feedback = strip_think_blocks(&feedback);
        if feedback.to_lowercase().contains(NO_ISSUES) {
            tracing::info!(file = %filename, "coder: no issues found, skipping refactor");
            return Ok(WorkerOutput::message(format!("Code generated for {filename}.")).with_code(filename, draft));
        }

        tracing::info!(file = %filename, "coder: refactoring");
        let refactored = extract_code(
            &self
                .ask(
                    REFACTOR_SYSTEM,
                    format!(
                        "Please refactor this code draft for '{filename}':\n---\n{draft}\n---\n\n\
                         Incorporate this feedback from the code review:\n---\n{}\n---",
                        feedback.trim()
                    ),
                )
                .await?,
        );
        if refactored.is_empty() {
            return Err(WorkerError::Failed(format!(
                "Refactoring step produced no code for '{filename}'."
            )));
        }
        Ok(WorkerOutput::message(format!("Code generated and reviewed for {filename}."))
            .with_code(filename, refactored))
    }
}
