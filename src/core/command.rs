//! 命令语言：Planner / Resolver 与 Worker 之间的约定
//!
//! description 字符串在派发时只解析一次，得到封闭的 Command 变体，各 Worker 只处理自己认识的变体。
//! 动词大小写不敏感、忽略首尾空白；文件名取第一个匹配 `[\w.\-]+` 的单/双引号片段。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::CommandError;

const CREATE_PROJECT_STRUCTURE: &str = "CREATE PROJECT STRUCTURE";
const CREATE_STANDARD_STRUCTURE: &str = "CREATE STANDARD STRUCTURE";
const CREATE_EMPTY_FILE: &str = "CREATE EMPTY FILE";
const SAVE_CODE_TO: &str = "SAVE CODE TO";
const READ_FILE: &str = "READ FILE";

fn quoted_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"['"]([\w.\-]+)['"]"#).expect("valid regex"))
}

/// 解析后的命令
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `CREATE PROJECT STRUCTURE`
    CreateStructure,
    /// `CREATE STANDARD STRUCTURE <type>`
    CreateStandardStructure(String),
    /// `CREATE EMPTY FILE '<name>'`
    CreateEmptyFile(String),
    /// `SAVE CODE TO '<name>'`
    SaveCode(String),
    /// `READ FILE '<name>'`
    ReadFile(String),
    /// 其它任意文本：交给 shell（原样执行）或 coder（自然语言生成请求）
    Opaque(String),
}

impl Command {
    pub fn parse(description: &str) -> Result<Self, CommandError> {
        let trimmed = description.trim();
        let upper = trimmed.to_uppercase();

        if starts_with_verb(&upper, CREATE_PROJECT_STRUCTURE) {
            return Ok(Command::CreateStructure);
        }
        if starts_with_verb(&upper, CREATE_STANDARD_STRUCTURE) {
            let rest = trimmed
                .get(CREATE_STANDARD_STRUCTURE.len()..)
                .unwrap_or_default()
                .trim();
            let kind = rest
                .split_whitespace()
                .next()
                .map(|t| t.trim_matches(|c| c == '\'' || c == '"'))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| malformed(trimmed, "missing structure type"))?;
            return Ok(Command::CreateStandardStructure(kind.to_lowercase()));
        }
        if starts_with_verb(&upper, CREATE_EMPTY_FILE) {
            return Ok(Command::CreateEmptyFile(required_filename(trimmed)?));
        }
        if starts_with_verb(&upper, SAVE_CODE_TO) {
            return Ok(Command::SaveCode(required_filename(trimmed)?));
        }
        if starts_with_verb(&upper, READ_FILE) {
            return Ok(Command::ReadFile(required_filename(trimmed)?));
        }
        Ok(Command::Opaque(trimmed.to_string()))
    }

    /// 文件类命令的目标文件名
    pub fn filename(&self) -> Option<&str> {
        match self {
            Command::CreateEmptyFile(name) | Command::SaveCode(name) | Command::ReadFile(name) => {
                Some(name)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::CreateStructure => f.write_str(CREATE_PROJECT_STRUCTURE),
            Command::CreateStandardStructure(kind) => {
                write!(f, "{CREATE_STANDARD_STRUCTURE} {kind}")
            }
            Command::CreateEmptyFile(name) => write!(f, "{CREATE_EMPTY_FILE} '{name}'"),
            Command::SaveCode(name) => write!(f, "{SAVE_CODE_TO} '{name}'"),
            Command::ReadFile(name) => write!(f, "{READ_FILE} '{name}'"),
            Command::Opaque(text) => f.write_str(text),
        }
    }
}

/// 第一个引号包裹的文件名
pub fn extract_quoted_filename(text: &str) -> Option<String> {
    quoted_name_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// 动词必须是完整单词：`READ FILES` 不算 `READ FILE`
fn starts_with_verb(upper: &str, verb: &str) -> bool {
    upper.starts_with(verb)
        && upper
            .get(verb.len()..)
            .and_then(|rest| rest.chars().next())
            .map_or(true, |c| c.is_whitespace() || c == '\'' || c == '"')
}

fn required_filename(command: &str) -> Result<String, CommandError> {
    extract_quoted_filename(command)
        .ok_or_else(|| malformed(command, "could not find a quoted filename"))
}

fn malformed(command: &str, reason: &str) -> CommandError {
    CommandError::MalformedCommand {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_code_filename_any_case_and_whitespace() {
        for raw in [
            "SAVE CODE TO 'index.html'",
            "  save code to 'index.html'  ",
            "Save Code To \"index.html\"",
            "\tSAVE CODE TO 'index.html'\n",
        ] {
            assert_eq!(
                Command::parse(raw).unwrap(),
                Command::SaveCode("index.html".to_string()),
                "input: {raw:?}"
            );
        }
    }

    #[test]
    fn test_create_project_structure() {
        assert_eq!(
            Command::parse("create project structure").unwrap(),
            Command::CreateStructure
        );
    }

    #[test]
    fn test_create_standard_structure_type() {
        assert_eq!(
            Command::parse("CREATE STANDARD STRUCTURE web_project").unwrap(),
            Command::CreateStandardStructure("web_project".to_string())
        );
        assert_eq!(
            Command::parse("CREATE STANDARD STRUCTURE 'Python_Package'").unwrap(),
            Command::CreateStandardStructure("python_package".to_string())
        );
    }

    #[test]
    fn test_standard_structure_without_type_is_malformed() {
        let err = Command::parse("CREATE STANDARD STRUCTURE").unwrap_err();
        assert!(matches!(err, CommandError::MalformedCommand { .. }));
    }

    #[test]
    fn test_empty_file_and_read_file() {
        assert_eq!(
            Command::parse("CREATE EMPTY FILE 'styles.css'").unwrap(),
            Command::CreateEmptyFile("styles.css".to_string())
        );
        assert_eq!(
            Command::parse("READ FILE \"app-v2.py\"").unwrap(),
            Command::ReadFile("app-v2.py".to_string())
        );
    }

    #[test]
    fn test_missing_quoted_filename_is_malformed() {
        for raw in ["SAVE CODE TO index.html", "READ FILE", "CREATE EMPTY FILE notes.txt"] {
            let err = Command::parse(raw).unwrap_err();
            assert!(err.to_string().contains("Malformed command"), "input: {raw}");
        }
    }

    #[test]
    fn test_other_text_is_opaque() {
        assert_eq!(
            Command::parse("  python3 main.py ").unwrap(),
            Command::Opaque("python3 main.py".to_string())
        );
        assert_eq!(
            Command::parse("Generate code for 'main.py' that prints hello").unwrap(),
            Command::Opaque("Generate code for 'main.py' that prints hello".to_string())
        );
    }

    #[test]
    fn test_verb_must_be_whole_word() {
        assert!(matches!(
            Command::parse("READ FILES from disk").unwrap(),
            Command::Opaque(_)
        ));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let cmd = Command::SaveCode("main.py".to_string());
        assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);
    }
}
