//! 路由：对入站请求分类并分派
//!
//! 直连模式（查询 / 写入 / 检索）绕过 FlowController，经 ToolExecutor 直接调用工具；
//! 升级模式先向 Planner 取计划，再由 FlowController 逐步执行。分类失败时默认升级。
//! 无论哪条路径，调用方拿到的都是结构化的 RouterResponse，不会直接看到错误。

pub mod intent;
pub mod planner;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RouterSection;
use crate::core::EngineError;
use crate::execution::{ExecuteOptions, ExecutionMetadata, FlowController};
use crate::tools::{ToolExecutor, ToolRegistry};

pub use intent::{Classifier, ExecutionMode, KeywordClassifier};
pub use planner::{Plan, PlanStep, PlanTask, Planner, SequentialPlanner};

/// 入站请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRequest {
    pub text: String,
    /// 直连模式下原样交给工具的请求体；缺省时由 text 构造
    #[serde(default)]
    pub payload: Option<Value>,
}

impl RouterRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterResponse {
    pub success: bool,
    pub mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timeout: bool,
    /// 仅升级模式携带
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
}

impl RouterResponse {
    fn direct(mode: ExecutionMode, result: Result<Value, EngineError>) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                mode,
                result: Some(value),
                error: None,
                timeout: false,
                metadata: None,
            },
            Err(e) => Self::failure(mode, &e),
        }
    }

    fn failure(mode: ExecutionMode, error: &EngineError) -> Self {
        Self {
            success: false,
            mode,
            result: None,
            error: Some(error.to_string()),
            timeout: error.is_timeout(),
            metadata: None,
        }
    }
}

/// 直连模式使用的工具名与超时
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub lookup_tool: String,
    pub insert_tool: String,
    pub search_tool: String,
    pub direct_timeout: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&RouterSection::default())
    }
}

impl From<&RouterSection> for RouterSettings {
    fn from(section: &RouterSection) -> Self {
        Self {
            lookup_tool: section.lookup_tool.clone(),
            insert_tool: section.insert_tool.clone(),
            search_tool: section.search_tool.clone(),
            direct_timeout: Duration::from_millis(section.direct_timeout_ms),
        }
    }
}

pub struct Router {
    controller: Arc<FlowController>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    classifier: Arc<dyn Classifier>,
    planner: Arc<dyn Planner>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        controller: Arc<FlowController>,
        registry: Arc<ToolRegistry>,
        classifier: Arc<dyn Classifier>,
        planner: Arc<dyn Planner>,
        settings: RouterSettings,
    ) -> Self {
        let executor = ToolExecutor::new(Arc::clone(&registry), settings.direct_timeout);
        Self {
            controller,
            registry,
            executor,
            classifier,
            planner,
            settings,
        }
    }

    pub fn controller(&self) -> &Arc<FlowController> {
        &self.controller
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 分类；识别不出时升级
    pub async fn classify(&self, request: &RouterRequest) -> ExecutionMode {
        self.classifier
            .classify(request)
            .await
            .unwrap_or(ExecutionMode::Escalate)
    }

    pub async fn handle(&self, request: RouterRequest) -> RouterResponse {
        let mode = self.classify(&request).await;
        tracing::info!(mode = ?mode, text_len = request.text.len(), "Routing request");

        match mode {
            ExecutionMode::DirectLookup => self.direct(mode, &self.settings.lookup_tool, &request).await,
            ExecutionMode::DirectInsert => self.direct(mode, &self.settings.insert_tool, &request).await,
            ExecutionMode::DirectSearch => self.direct(mode, &self.settings.search_tool, &request).await,
            ExecutionMode::Escalate => self.escalate(&request).await,
        }
    }

    async fn direct(&self, mode: ExecutionMode, tool: &str, request: &RouterRequest) -> RouterResponse {
        let body = request
            .payload
            .clone()
            .unwrap_or_else(|| json!({ "query": intent::strip_keyword(&request.text) }));
        let result = self.executor.execute(tool, body).await;
        if let Err(e) = &result {
            tracing::warn!(mode = ?mode, tool, error = %e, "Direct call failed");
        }
        RouterResponse::direct(mode, result)
    }

    async fn escalate(&self, request: &RouterRequest) -> RouterResponse {
        let plan = match self.planner.plan(request).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "Planning failed");
                return RouterResponse::failure(ExecutionMode::Escalate, &EngineError::PlanningFailed(e));
            }
        };
        tracing::debug!(goal = %plan.goal, steps = plan.steps.len(), "Plan ready");

        let input = json!({ "text": request.text, "plan": plan });
        let task = PlanTask::new(plan, Arc::clone(&self.registry));
        let result = self
            .controller
            .execute_task(&task, input, ExecuteOptions::default())
            .await;

        RouterResponse {
            success: result.success,
            mode: ExecutionMode::Escalate,
            result: result.result,
            error: result.error,
            timeout: result.timeout,
            metadata: Some(result.metadata),
        }
    }
}
