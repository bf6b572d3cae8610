//! Ultron - 多智能体任务编排器
//!
//! 把自然语言目标拆成子任务，逐个派发给专门的 Worker（代码生成、文件、Shell、搜索），
//! 失败时由 ErrorResolver 重写剩余计划。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 共享状态、命令语言、错误类型、预检、主控循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **planning**: Planner、ErrorResolver 与生成器输出解析
//! - **workers**: Worker trait、注册表、派发器与内置 Worker

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod planning;
pub mod workers;

pub use crate::core::{Orchestrator, RunReport, SharedState, Subtask, TaskStatus};
