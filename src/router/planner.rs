//! 规划器与计划任务
//!
//! Planner 把一个多步请求拆成有序的 PlanStep；PlanTask 逐步经 FlowController 调用工具，
//! 并实现显式恢复钩子，可从任意步序号继续。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::intent::strip_keyword;
use super::RouterRequest;
use crate::core::EngineError;
use crate::execution::{Resumable, Resumption, SuspendedState, Task, TaskContext};
use crate::tools::ToolRegistry;

/// 计划中的单步：调用哪个工具、带什么请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    pub request: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &RouterRequest) -> Result<Plan, String>;
}

/// 按 `then` / `;` 切分请求，每段生成一次检索
pub struct SequentialPlanner {
    tool: String,
}

impl SequentialPlanner {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

#[async_trait]
impl Planner for SequentialPlanner {
    async fn plan(&self, request: &RouterRequest) -> Result<Plan, String> {
        let steps: Vec<PlanStep> = split_subtasks(&request.text)
            .into_iter()
            .map(|part| PlanStep {
                tool: self.tool.clone(),
                request: json!({ "query": strip_keyword(&part) }),
            })
            .collect();

        if steps.is_empty() {
            return Err("Nothing to plan: empty request".to_string());
        }
        Ok(Plan {
            goal: request.text.trim().to_string(),
            steps,
        })
    }
}

fn split_subtasks(text: &str) -> Vec<String> {
    text.split(';')
        .flat_map(|segment| segment.split(" then "))
        .flat_map(|segment| segment.split("然后"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 执行一个 Plan 的任务
pub struct PlanTask {
    plan: Plan,
    registry: Arc<ToolRegistry>,
}

impl PlanTask {
    pub fn new(plan: Plan, registry: Arc<ToolRegistry>) -> Self {
        Self { plan, registry }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }
}

#[async_trait]
impl Task for PlanTask {
    fn kind(&self) -> &str {
        "plan"
    }

    async fn run(&self, ctx: &mut TaskContext) -> Result<Value, EngineError> {
        self.continue_from_step(ctx, 0).await
    }

    fn resumption(&self) -> Resumption<'_> {
        Resumption::Hooks(self)
    }
}

#[async_trait]
impl Resumable for PlanTask {
    fn restore_context(&self, ctx: &mut TaskContext, state: &SuspendedState) {
        ctx.results = state.context.results.clone();
        ctx.step_index = state.context.step_index;
    }

    fn integrate_tool_response(&self, ctx: &mut TaskContext, response: Value) {
        ctx.integrate(response);
    }

    async fn continue_from_step(&self, ctx: &mut TaskContext, index: usize) -> Result<Value, EngineError> {
        if index > self.plan.steps.len() {
            return Err(EngineError::TaskFailed(format!(
                "cannot resume at step {index}: plan has {} steps",
                self.plan.steps.len()
            )));
        }
        for step in self.plan.steps.iter().skip(index) {
            let tool = self
                .registry
                .get(&step.tool)
                .ok_or_else(|| EngineError::UnknownTool(step.tool.clone()))?;
            ctx.call_tool(tool.as_ref(), step.request.clone()).await?;
        }
        Ok(json!({
            "goal": self.plan.goal,
            "steps": self.plan.steps.len(),
            "results": ctx.results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{
        EventDispatcher, ExecutionSettings, ExecutionStateStore, FlowController, SuspendedContext,
    };
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_sequential_plan() {
        let planner = SequentialPlanner::new("search");
        let plan = planner
            .plan(&RouterRequest::new("search rust then find tokio; docs"))
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.steps.iter().all(|s| s.tool == "search"));
        assert_eq!(plan.steps[0].request, json!({"query": "rust"}));
        assert_eq!(plan.steps[1].request, json!({"query": "tokio"}));
        assert_eq!(plan.steps[2].request, json!({"query": "docs"}));
    }

    fn single_step_task() -> PlanTask {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool::new("search"));
        let plan = Plan {
            goal: "one".to_string(),
            steps: vec![PlanStep {
                tool: "search".to_string(),
                request: json!({"query": "one"}),
            }],
        };
        PlanTask::new(plan, Arc::new(registry))
    }

    fn controller() -> Arc<FlowController> {
        let store = Arc::new(ExecutionStateStore::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&store)));
        Arc::new(FlowController::new(store, dispatcher, ExecutionSettings::default()))
    }

    fn suspended_at(step_index: usize, results: Vec<Value>) -> SuspendedState {
        SuspendedState::new(
            "call_plan",
            SuspendedContext {
                results,
                step_index,
                request: json!({}),
            },
            Some("search".into()),
            None,
        )
    }

    #[tokio::test]
    async fn test_resume_after_last_step_finishes_plan() {
        let out = controller()
            .continue_execution(&single_step_task(), None, suspended_at(0, vec![]), json!({"query": "one"}))
            .await
            .unwrap();
        assert_eq!(out["results"], json!([{"query": "one"}]));
    }

    #[tokio::test]
    async fn test_resume_past_plan_end_fails_task() {
        let err = controller()
            .continue_execution(&single_step_task(), None, suspended_at(4, vec![json!(1)]), json!(2))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskFailed(msg) if msg.contains("step 5")));
    }

    #[tokio::test]
    async fn test_empty_request_fails_planning() {
        let planner = SequentialPlanner::new("search");
        assert!(planner.plan(&RouterRequest::new(" ; ")).await.is_err());
    }
}
