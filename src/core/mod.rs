//! 核心层：错误类型、引擎装配、优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{create_engine_builder, try_create_engine_builder, Engine, EngineBuilder};
pub use error::EngineError;
pub use shutdown::{ExecutionCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
