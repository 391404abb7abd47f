//! 执行连续性：挂起状态存储、事件分发、流程控制与任务契约
//!
//! 三者通过构造函数注入共享：Store 被 Dispatcher 与 FlowController 共同持有，
//! Dispatcher 被 FlowController 持有；测试可各自构建互相隔离的实例。

pub mod dispatcher;
pub mod flow;
pub mod state_store;
pub mod task;
pub mod types;

pub use dispatcher::{
    DispatchOutcome, DispatcherStats, Event, EventDispatcher, EventKind, EventPriority, ListenerOptions,
    OutcomeStatus, Resolution,
};
pub use flow::{
    EngineStats, ExecuteOptions, ExecutionMetadata, ExecutionResult, ExecutionSettings, FlowController,
    HealthReport,
};
pub use state_store::ExecutionStateStore;
pub use task::{Resumable, Resumption, Task, TaskContext};
pub use types::{
    Execution, ExecutionId, ExecutionStatus, Identity, Step, StepStatus, SuspendedContext, SuspendedState,
    SuspendedStatus,
};
