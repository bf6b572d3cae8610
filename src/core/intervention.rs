//! 人工介入：运行无法自行继续时给出的阻断提示
//!
//! 系统从不等待人工输入：渲染提示后本次运行即以 failed 结束，人工处理后重新发起任务。

/// Planner / Resolver 用来请求人工介入的保留 agent 名
pub const HUMAN_INTERVENTION: &str = "human_intervention";

/// 渲染结构化、边界清晰的求助信息
pub fn render_help_request(problem: &str) -> String {
    let bar = "=".repeat(72);
    format!(
        "{bar}\n\
         ||                       ATTENTION REQUIRED                         ||\n\
         {bar}\n\
         \n\
         The multi-agent system has encountered an issue it cannot resolve on its own.\n\
         \n\
         Problem:\n  {}\n\
         \n\
         Next steps:\n  \
         Please resolve this issue in your terminal, then restart the task.\n  \
         For example, you may need to install a missing tool or grant permissions.\n\
         {bar}",
        problem.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_help_request_contains_problem_and_banner() {
        let msg = render_help_request("  sudo needs a password ");
        assert!(msg.contains("ATTENTION REQUIRED"));
        assert!(msg.contains("sudo needs a password"));
        assert!(msg.starts_with("===="));
        assert!(msg.ends_with("===="));
    }
}
