//! 运行前预检：确认任务依赖的命令行工具已安装
//!
//! 只在主循环开始前执行一次；缺少工具时运行直接以 failed 结束。

use std::collections::BTreeMap;

/// 工具存在性检查（可替换，便于测试）
pub trait ToolProbe: Send + Sync {
    fn is_installed(&self, tool: &str) -> bool;
}

/// 基于 PATH 查找（which / where）
#[derive(Debug, Default, Clone, Copy)]
pub struct WhichProbe;

impl ToolProbe for WhichProbe {
    fn is_installed(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }
}

/// 返回 工具名 -> 是否已安装
pub fn check_dependencies(probe: &dyn ToolProbe, required_tools: &[String]) -> BTreeMap<String, bool> {
    tracing::info!(tools = ?required_tools, "Running pre-flight check");
    required_tools
        .iter()
        .map(|tool| {
            let installed = probe.is_installed(tool);
            if installed {
                tracing::info!(tool = %tool, "tool is installed");
            } else {
                tracing::warn!(tool = %tool, "tool is NOT installed");
            }
            (tool.clone(), installed)
        })
        .collect()
}

/// 预检结果中缺失的工具
pub fn missing_tools(status: &BTreeMap<String, bool>) -> Vec<String> {
    status
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(tool, _)| tool.clone())
        .collect()
}
