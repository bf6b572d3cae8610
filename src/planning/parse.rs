//! 解析边界：生成器原始文本 → 已校验的结构
//!
//! 生成器输出不可信：可能夹带说明文字、markdown 代码块、推理模型的 `<think>` 块、截断或非法 JSON。
//! 这里只做「找出第一个合法 JSON 数组 / 对象」这一件事，结果以 ParseResult 形式交给调用方。

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::Subtask;

fn think_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?(?:</think>|\z)").expect("valid regex"))
}

/// 计划解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// 非空计划
    Plan(Vec<Subtask>),
    /// 有内容但找不到可用的计划数组
    Malformed(String),
    /// 空回复或空数组
    Empty,
}

impl ParseResult {
    /// 非空计划才算可用
    pub fn into_plan(self) -> Option<Vec<Subtask>> {
        match self {
            ParseResult::Plan(plan) if !plan.is_empty() => Some(plan),
            _ => None,
        }
    }

    /// 不可用时的原因（写入 history）
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ParseResult::Plan(plan) if !plan.is_empty() => None,
            ParseResult::Malformed(reason) => Some(reason.clone()),
            ParseResult::Plan(_) | ParseResult::Empty => Some("planner returned an empty plan".to_string()),
        }
    }
}

/// 去掉推理模型的 `<think>…</think>`（未闭合时删到结尾）
pub fn strip_think_blocks(text: &str) -> String {
    think_block_re().replace_all(text, "").into_owned()
}

/// 从任意文本中提取第一个由对象组成的合法 JSON 数组，转换为 Subtask 列表
///
/// 缺字段的对象照样接收（字段为空串），由执行循环在弹出时判定为畸形子任务。
pub fn extract_plan(raw: &str) -> ParseResult {
    let text = strip_think_blocks(raw);
    if text.trim().is_empty() {
        return ParseResult::Empty;
    }

    let mut saw_empty_array = false;
    for (idx, _) in text.match_indices('[') {
        let Some(Value::Array(items)) = first_json_value(&text[idx..]) else {
            continue;
        };
        if items.is_empty() {
            saw_empty_array = true;
            continue;
        }
        if !items.iter().all(Value::is_object) {
            continue;
        }
        return match items
            .into_iter()
            .map(serde_json::from_value::<Subtask>)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(plan) => ParseResult::Plan(plan),
            Err(e) => ParseResult::Malformed(format!("plan entries are not valid subtasks: {e}")),
        };
    }

    if saw_empty_array {
        ParseResult::Empty
    } else {
        ParseResult::Malformed("no JSON array of subtasks found in generator output".to_string())
    }
}

/// 从任意文本中提取第一个能反序列化为 T 的 JSON 对象
pub fn extract_json_object<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let text = strip_think_blocks(raw);
    text.match_indices('{').find_map(|(idx, _)| match first_json_value(&text[idx..]) {
        Some(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

/// 以 text 开头解析一个完整 JSON 值，忽略其后的内容
fn first_json_value(text: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(text)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_plan_wrapped_in_prose_and_fences() {
        let raw = "Sure! Here is the plan:\n```json\n[\n  {\"agent\": \"file_agent\", \"description\": \"CREATE PROJECT STRUCTURE\"},\n  {\"agent\": \"shell_agent\", \"description\": \"ls\"}\n]\n```\nGood luck.";
        let plan = extract_plan(raw).into_plan().unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], Subtask::new("file_agent", "CREATE PROJECT STRUCTURE"));
    }

    #[test]
    fn test_think_block_is_ignored() {
        let raw = "<think>maybe [1, 2] or [{\"agent\": \"x\"}]</think>[{\"agent\": \"shell_agent\", \"description\": \"pwd\"}]";
        let plan = extract_plan(raw).into_plan().unwrap();
        assert_eq!(plan, vec![Subtask::new("shell_agent", "pwd")]);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(extract_plan(""), ParseResult::Empty);
        assert_eq!(extract_plan("   \n"), ParseResult::Empty);
        assert_eq!(extract_plan("[]"), ParseResult::Empty);
        assert!(ParseResult::Empty.failure_reason().is_some());
        assert!(ParseResult::Plan(vec![]).failure_reason().is_some());
    }

    #[test]
    fn test_truncated_json_is_malformed() {
        let raw = "[{\"agent\": \"file_agent\", \"description\": \"CREATE PRO";
        assert!(matches!(extract_plan(raw), ParseResult::Malformed(_)));
    }

    #[test]
    fn test_skips_non_object_arrays() {
        let raw = "steps [1, 2, 3] then [{\"agent\": \"coder_agent\", \"description\": \"Generate code for 'a.py'\"}]";
        let plan = extract_plan(raw).into_plan().unwrap();
        assert_eq!(plan[0].agent, "coder_agent");
    }

    #[test]
    fn test_missing_field_survives_parse() {
        let plan = extract_plan(r#"[{"agent": "file_agent"}]"#).into_plan().unwrap();
        assert!(!plan[0].is_well_formed());
    }

    #[test]
    fn test_wrong_field_type_is_malformed() {
        let result = extract_plan(r#"[{"agent": 42, "description": "x"}]"#);
        assert!(matches!(result, ParseResult::Malformed(_)));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        category: String,
    }

    #[test]
    fn test_extract_json_object() {
        let raw = "Analysis: {not json} then {\"category\": \"permissions\", \"extra\": 1} done";
        let probe: Probe = extract_json_object(raw).unwrap();
        assert_eq!(probe.category, "permissions");
        assert!(extract_json_object::<Probe>("nothing here").is_none());
    }
}
