//! 任务契约与任务上下文
//!
//! Task 只需实现 run；需要精细恢复的任务可通过 resumption() 暴露 Resumable 钩子，
//! 否则恢复时退回到「合并响应后重新调用 run」。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::EngineError;
use crate::execution::flow::FlowController;
use crate::execution::types::{ExecutionId, SuspendedState};
use crate::tools::Tool;

/// 由 FlowController 驱动的长任务
#[async_trait]
pub trait Task: Send + Sync {
    /// 任务类型标签（记录在 Execution.kind）
    fn kind(&self) -> &str;

    async fn run(&self, ctx: &mut TaskContext) -> Result<Value, EngineError>;

    /// 恢复能力；默认重新执行 run
    fn resumption(&self) -> Resumption<'_> {
        Resumption::Rerun
    }
}

/// 任务的恢复方式
pub enum Resumption<'a> {
    /// 任务提供显式的 restore / integrate / continue 钩子
    Hooks(&'a dyn Resumable),
    /// 合并响应后重新调用 run
    Rerun,
}

/// 显式恢复钩子
#[async_trait]
pub trait Resumable: Send + Sync {
    fn restore_context(&self, ctx: &mut TaskContext, state: &SuspendedState);

    fn integrate_tool_response(&self, ctx: &mut TaskContext, response: Value);

    async fn continue_from_step(&self, ctx: &mut TaskContext, index: usize) -> Result<Value, EngineError>;
}

/// 任务运行时看到的上下文：原始输入、已累积的结果、当前步序号
pub struct TaskContext {
    controller: Arc<FlowController>,
    execution_id: Option<ExecutionId>,
    pub input: Value,
    pub results: Vec<Value>,
    pub step_index: usize,
}

impl TaskContext {
    pub(crate) fn new(controller: Arc<FlowController>, execution_id: Option<ExecutionId>, input: Value) -> Self {
        Self {
            controller,
            execution_id,
            input,
            results: Vec::new(),
            step_index: 0,
        }
    }

    /// 由挂起状态重建上下文
    pub(crate) fn from_state(
        controller: Arc<FlowController>,
        execution_id: Option<ExecutionId>,
        state: &SuspendedState,
    ) -> Self {
        Self {
            controller,
            execution_id,
            input: state.context.request.clone(),
            results: state.context.results.clone(),
            step_index: state.context.step_index,
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    pub fn controller(&self) -> &Arc<FlowController> {
        &self.controller
    }

    /// 经 FlowController 调用外部工具；成功时响应并入上下文
    pub async fn call_tool(&mut self, tool: &dyn Tool, request: Value) -> Result<Value, EngineError> {
        let response = self
            .controller
            .call_external_tool(tool, request, self.execution_id.as_deref())
            .await?;
        self.integrate(response.clone());
        Ok(response)
    }

    /// 追加一个工具结果并推进步序号
    pub fn integrate(&mut self, response: Value) {
        self.results.push(response);
        self.step_index += 1;
    }
}
