//! 直连工具执行器
//!
//! Router 的直连模式（查询 / 写入 / 检索）绕过 FlowController，直接在超时内调用 registry；
//! 超时或失败时转为 EngineError（ToolTimeout / ToolError）。每次调用输出结构化审计日志（JSON），
//! FlowController 的受控调用也复用同一审计格式。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::EngineError;
use crate::tools::{Tool, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 EngineError
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；未注册返回 UnknownTool，超时返回 ToolTimeout，工具返回 Err 则转为 ToolError
    pub async fn execute(&self, tool_name: &str, request: Value) -> Result<Value, EngineError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| EngineError::UnknownTool(tool_name.to_string()))?;

        let start = Instant::now();
        let preview = request_preview(&request);
        let result = timeout(self.timeout, tool.execute(request)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        audit(tool_name, None, outcome, 1, start, &preview);

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(EngineError::ToolError(e)),
            Err(_) => Err(EngineError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

/// 输出一条工具调用审计日志
pub(crate) fn audit(
    tool: &str,
    identity: Option<&str>,
    outcome: &str,
    attempts: u32,
    start: Instant,
    request_preview: &str,
) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "identity": identity,
        "ok": outcome == "ok",
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": start.elapsed().as_millis() as u64,
        "request_preview": request_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

pub(crate) fn request_preview(request: &Value) -> String {
    let s = request.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
