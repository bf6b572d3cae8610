//! 规划层：Planner（生成计划）、ErrorResolver（失败后的修复计划）与生成器输出的解析边界

pub mod parse;
pub mod planner;
pub mod resolver;

pub use parse::{extract_json_object, extract_plan, strip_think_blocks, ParseResult};
pub use planner::Planner;
pub use resolver::{fallback_plan, ErrorResolver, Resolution, ResolutionSource, ResolverGuard};
