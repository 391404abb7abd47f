//! 引擎错误类型
//!
//! Store / Dispatcher 对「预期内的缺失」返回结构化结果而非错误；
//! 只有工具失败、回调失败、超时、取消等才以 EngineError 向上传播，
//! 最终由 FlowController 转为 Execution 的终态。

use thiserror::Error;

/// 执行连续性引擎中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// 该 identity 没有存活的挂起状态（已处理过或从未保存）
    #[error("Suspended state not found: {0}")]
    NotFound(String),

    #[error("Invalid identity")]
    InvalidIdentity,

    #[error("Identity already in use: {0}")]
    DuplicateIdentity(String),

    /// identity 已被清理过，不可再次使用
    #[error("Identity already retired: {0}")]
    RetiredIdentity(String),

    /// 计时器已把挂起状态标记为 timeout，迟到的响应不再被接受
    #[error("Wait already timed out: {0}")]
    WaitTimedOut(String),

    /// 单次工具调用超时
    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 整个 Execution 超过总时限
    #[error("Execution timeout after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Tool execution failed: {0}")]
    ToolError(String),

    #[error("Callback failed: {0}")]
    CallbackError(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// 同一 Execution 内上一个 Step 尚未关闭
    #[error("Step already in progress for execution {0}")]
    StepInProgress(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl EngineError {
    /// 调用级或 Execution 级超时（结果中以 timeout: true 区分）
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ToolTimeout(_) | Self::ExecutionTimeout(_) | Self::WaitTimedOut(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(EngineError::ToolTimeout("search".into()).is_timeout());
        assert!(EngineError::ExecutionTimeout(50).is_timeout());
        assert!(!EngineError::ToolError("boom".into()).is_timeout());
        assert!(!EngineError::Cancelled.is_timeout());
        assert!(EngineError::WaitTimedOut("x".into()).is_timeout());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: EngineError = config::ConfigError::Message("bad key".into()).into();
        assert_eq!(err, EngineError::Config("bad key".into()));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            EngineError::NotFound("exec_1:0".into()).to_string(),
            "Suspended state not found: exec_1:0"
        );
        assert_eq!(
            EngineError::ExecutionTimeout(50).to_string(),
            "Execution timeout after 50ms"
        );
    }
}
