//! Hive - 执行连续性引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、引擎装配、优雅关闭
//! - **execution**: 挂起状态存储、事件分发、流程控制、任务契约
//! - **observability**: 日志初始化
//! - **router**: 请求分类、规划与分派
//! - **tools**: 工具契约、注册表与直连执行器

pub mod config;
pub mod core;
pub mod execution;
pub mod observability;
pub mod router;
pub mod tools;

pub use crate::core::{EngineBuilder, EngineError};
pub use execution::{EventDispatcher, ExecutionStateStore, FlowController};
pub use router::{Router, RouterRequest, RouterResponse};
