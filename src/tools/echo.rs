//! Echo 工具（演示与测试用）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// Echo 工具：原样返回请求。
///
/// 请求中的 `delay_ms` 模拟耗时，`fail` 为字符串时以该信息失败。
pub struct EchoTool {
    name: String,
}

impl EchoTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for EchoTool {
    fn default() -> Self {
        Self::new("echo")
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the request back. Args: {\"delay_ms\": 0, \"fail\": \"reason\"} (both optional)"
    }

    async fn execute(&self, request: Value) -> Result<Value, String> {
        if let Some(delay) = request.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(reason) = request.get("fail").and_then(|v| v.as_str()) {
            return Err(reason.to_string());
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_returns_request() {
        let tool = EchoTool::default();
        assert_eq!(tool.name(), "echo");
        let out = tool.execute(json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_echo_fail_field() {
        let tool = EchoTool::new("insert");
        let err = tool.execute(json!({"fail": "disk full"})).await.unwrap_err();
        assert_eq!(err, "disk full");
    }
}
