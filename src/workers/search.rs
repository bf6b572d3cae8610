//! Search Worker：查询可配置的 HTML 搜索端点，返回可读文本
//!
//! 默认端点为 DuckDuckGo HTML 版（GET ?q=...）；HTML 响应经 html2text 转为文本，
//! 超过 max_result_chars 时截断并追加 ...[truncated]。结果只进入 last_execution_output。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;

use crate::core::{Command, SharedState};
use crate::workers::{Worker, WorkerError, WorkerOutput, SEARCH_AGENT};

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// html2text 失败时的回退：去标签并压缩空白
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start().to_lowercase();
    s.starts_with("<!doctype") || s.starts_with("<html") || (s.contains("</") && s.contains('<'))
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        text.chars().take(max).collect::<String>() + "\n...[truncated]"
    } else {
        text.to_string()
    }
}

pub struct SearchWorker {
    client: Client,
    endpoint: String,
    max_result_chars: usize,
}

impl SearchWorker {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            max_result_chars,
        }
    }

    fn html_to_text(html: &str) -> String {
        match from_read(html.as_bytes(), 120) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => strip_html_tags(html),
        }
    }

    async fn search(&self, query: &str) -> Result<String, WorkerError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| WorkerError::Failed(format!("Search request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(WorkerError::Failed(format!("Search failed: HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| WorkerError::Failed(format!("Search response unreadable: {e}")))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            Self::html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(truncate_chars(text.trim(), self.max_result_chars))
    }
}

#[async_trait]
impl Worker for SearchWorker {
    fn name(&self) -> &str {
        SEARCH_AGENT
    }

    fn description(&self) -> &str {
        "Searches the web for the given query text and returns the results as plain text (documentation, error messages, library usage)."
    }

    async fn run(&self, command: &Command, _state: &SharedState) -> Result<WorkerOutput, WorkerError> {
        let Command::Opaque(query) = command else {
            return Err(WorkerError::Unsupported {
                worker: SEARCH_AGENT.to_string(),
                command: command.to_string(),
            });
        };
        if query.trim().is_empty() {
            return Err(WorkerError::Failed("Empty search query".to_string()));
        }
        tracing::info!(query = %query, endpoint = %self.endpoint, "search worker");
        let results = self.search(query).await?;
        if results.is_empty() {
            return Err(WorkerError::Failed(format!("No search results for '{query}'")));
        }
        Ok(WorkerOutput::message(results))
    }
}
