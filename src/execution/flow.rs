//! 流程控制器：端到端运行一个 Execution，并居中协调它发出的每一次外部调用
//!
//! Execution 状态机：initializing → running → (waiting ⇄ running)* → completing → {completed | failed | timeout}。
//! 每次外部调用：生成 identity → 追加 Step → 快照存入 Store 并进入 waiting → 启动超时 →
//! 在「工具返回 / 计时器触发 / 取消」三者之间竞争 → 经 Dispatcher 裁决结果 → 关闭 Step、清理 Store。
//! 同一 Execution 内调用严格串行；不同 Execution 之间只共享 Store 与 Dispatcher。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionSection;
use crate::core::EngineError;
use crate::execution::dispatcher::{EventDispatcher, ListenerOptions, OutcomeStatus};
use crate::execution::state_store::ExecutionStateStore;
use crate::execution::task::{Resumption, Task, TaskContext};
use crate::execution::types::{
    now_millis, Execution, ExecutionId, ExecutionStatus, Identity, StepStatus, SuspendedContext,
    SuspendedState, SuspendedStatus,
};
use crate::tools::executor::{audit, request_preview};
use crate::tools::Tool;

/// 运行时设置（由 [execution] 配置段构建）
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub tool_timeout: Duration,
    pub execution_timeout: Duration,
    /// 工具调用超时是否收紧到 Execution 剩余时间
    pub clamp_tool_timeout: bool,
    pub tool_max_retries: u32,
    pub reap_after: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from(&ExecutionSection::default())
    }
}

impl From<&ExecutionSection> for ExecutionSettings {
    fn from(section: &ExecutionSection) -> Self {
        Self {
            tool_timeout: section.tool_timeout(),
            execution_timeout: section.execution_timeout(),
            clamp_tool_timeout: section.clamp_tool_timeout,
            tool_max_retries: section.tool_max_retries,
            reap_after: section.reap_after(),
        }
    }
}

/// execute_task 的选项
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// 覆盖默认的 Execution 时限
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetadata {
    pub execution_id: ExecutionId,
    pub kind: String,
    pub status: ExecutionStatus,
    pub steps: usize,
    pub duration_ms: u64,
}

/// execute_task 的结构化结果；timeout 区分超时与普通失败
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timeout: bool,
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    fn from_execution(execution: &Execution) -> Self {
        Self {
            success: execution.status == ExecutionStatus::Completed,
            result: execution.result.clone(),
            error: execution.error.clone(),
            timeout: execution.status == ExecutionStatus::Timeout,
            metadata: ExecutionMetadata {
                execution_id: execution.id.clone(),
                kind: execution.kind.clone(),
                status: execution.status,
                steps: execution.steps.len(),
                duration_ms: execution.duration_ms(),
            },
        }
    }
}

/// 汇总统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub total_executions: u64,
    pub active_executions: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub active_listeners: usize,
    pub pending_events: usize,
    pub suspended_states: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub stats: EngineStats,
    pub checked_at: i64,
}

/// 运行中 Execution 的取消令牌与截止时间
struct LiveExecution {
    token: CancellationToken,
    deadline: Instant,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

enum Settled {
    Done(Result<Value, String>),
    TimedOut,
    Cancelled,
}

/// 流程控制器
pub struct FlowController {
    store: Arc<ExecutionStateStore>,
    dispatcher: Arc<EventDispatcher>,
    settings: ExecutionSettings,
    executions: RwLock<HashMap<ExecutionId, Execution>>,
    live: Mutex<HashMap<ExecutionId, LiveExecution>>,
    root_token: CancellationToken,
    counters: Counters,
}

impl FlowController {
    pub fn new(
        store: Arc<ExecutionStateStore>,
        dispatcher: Arc<EventDispatcher>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            executions: RwLock::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// 绑定进程级关闭令牌：关闭时所有 Execution 的子令牌一并取消
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.root_token = token;
        self
    }

    pub fn store(&self) -> &Arc<ExecutionStateStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// 运行一个任务直到完成、失败、超时或被取消；总是返回结构化结果
    pub async fn execute_task(
        self: &Arc<Self>,
        task: &dyn Task,
        input: Value,
        options: ExecuteOptions,
    ) -> ExecutionResult {
        let budget = options.timeout.unwrap_or(self.settings.execution_timeout);
        let mut execution = Execution::new(task.kind(), input.clone());
        let id = execution.id.clone();
        execution.transition(ExecutionStatus::Running);
        self.executions.write().await.insert(id.clone(), execution);

        let token = self.root_token.child_token();
        self.lock_live().insert(
            id.clone(),
            LiveExecution {
                token: token.clone(),
                deadline: Instant::now() + budget,
            },
        );
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(execution = %id, kind = task.kind(), budget_ms = budget.as_millis() as u64, "Execution started");

        let mut ctx = TaskContext::new(Arc::clone(self), Some(id.clone()), input);
        let outcome = tokio::select! {
            res = tokio::time::timeout(budget, task.run(&mut ctx)) => match res {
                Ok(result) => result,
                Err(_) => Err(EngineError::ExecutionTimeout(budget.as_millis() as u64)),
            },
            _ = token.cancelled() => Err(EngineError::Cancelled),
        };

        self.finish(&id, outcome).await
    }

    /// 受控的单次外部调用；execution 为 None 时不记录 Step，仅做挂起 / 超时 / 分发协调
    pub async fn call_external_tool(
        &self,
        tool: &dyn Tool,
        request: Value,
        execution: Option<&str>,
    ) -> Result<Value, EngineError> {
        let tool_name = tool.name().to_string();
        let identity: Identity = match execution {
            Some(exec_id) => format!("{exec_id}:step_{}", uuid::Uuid::new_v4()),
            None => format!("call_{}", uuid::Uuid::new_v4()),
        };

        let (step_index, context, token, deadline) = match execution {
            Some(exec_id) => {
                let (index, context) = self.begin_step(exec_id, &identity, &tool_name, &request).await?;
                let (token, deadline) = match self.lock_live().get(exec_id) {
                    Some(live) => (live.token.clone(), Some(live.deadline)),
                    None => (self.root_token.child_token(), None),
                };
                (Some(index), context, token, deadline)
            }
            None => (
                None,
                SuspendedContext {
                    results: Vec::new(),
                    step_index: 0,
                    request: request.clone(),
                },
                self.root_token.child_token(),
                None,
            ),
        };

        if let Err(e) = self.store.save(&identity, context, &tool_name, request.clone()).await {
            if let (Some(exec_id), Some(index)) = (execution, step_index) {
                self.settle_step(exec_id, index, &Err(e.clone())).await;
            }
            return Err(e);
        }

        let tool_timeout = self.effective_tool_timeout(deadline);
        let max_retries = self.settings.tool_max_retries;
        let options = ListenerOptions::default()
            .with_timeout(tool_timeout.saturating_mul(max_retries.saturating_add(1)))
            .with_retries(max_retries);
        self.dispatcher
            .register_continuation(&identity, |response| Ok(response), options)
            .await;

        let start = Instant::now();
        let preview = request_preview(&request);
        let mut attempts = 1u32;

        let result = loop {
            let timer = self.store.start_timeout(&identity, tool_timeout);
            let settled = tokio::select! {
                _ = token.cancelled() => Settled::Cancelled,
                fired = timer => match fired {
                    Ok(_) => Settled::TimedOut,
                    Err(_) => Settled::Cancelled,
                },
                res = tool.execute(request.clone()) => Settled::Done(res),
            };

            match settled {
                Settled::Done(Ok(response)) => {
                    let outcome = self.dispatcher.on_response(&identity, response.clone()).await;
                    break match outcome.status {
                        OutcomeStatus::Resumed => Ok(response),
                        OutcomeStatus::Failed => Err(EngineError::CallbackError(
                            outcome.error.unwrap_or_default(),
                        )),
                        _ if token.is_cancelled() => Err(EngineError::Cancelled),
                        // 计时器已触发：迟到的成功按超时处理
                        _ => Err(EngineError::ToolTimeout(tool_name.clone())),
                    };
                }
                Settled::Done(Err(message)) => {
                    let outcome = self.dispatcher.on_error(&identity, message.clone()).await;
                    if outcome.retry() {
                        attempts = attempts.saturating_add(1);
                        tracing::warn!(identity = %identity, tool = %tool_name, retry = outcome.retry_count, error = %message, "Tool failed, retrying");
                        if let (Some(exec_id), Some(index)) = (execution, step_index) {
                            self.record_attempt(exec_id, index, attempts).await;
                        }
                        continue;
                    }
                    break match outcome.status {
                        OutcomeStatus::TimedOut => Err(EngineError::ToolTimeout(tool_name.clone())),
                        _ if token.is_cancelled() => Err(EngineError::Cancelled),
                        _ => Err(EngineError::ToolError(message)),
                    };
                }
                Settled::TimedOut => {
                    self.dispatcher.on_timeout(&identity).await;
                    break Err(EngineError::ToolTimeout(tool_name.clone()));
                }
                Settled::Cancelled => {
                    self.dispatcher.remove_listener(&identity).await;
                    break Err(EngineError::Cancelled);
                }
            }
        };

        let final_status = match &result {
            Ok(_) => SuspendedStatus::Completed,
            Err(e) if e.is_timeout() => SuspendedStatus::Timeout,
            Err(_) => SuspendedStatus::Failed,
        };
        self.store.clear(&identity, final_status).await;
        self.dispatcher.remove_listener(&identity).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_timeout() => "timeout",
            Err(EngineError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        audit(&tool_name, Some(identity.as_str()), outcome, attempts, start, &preview);

        if let (Some(exec_id), Some(index)) = (execution, step_index) {
            self.settle_step(exec_id, index, &result).await;
        }
        result
    }

    /// 恢复路径：把工具响应重新注入任务，并从记录的步序号继续。
    ///
    /// 任务提供 Resumable 钩子时依次调用 restore / integrate / continue；否则合并响应后重新执行 run。
    /// state 已处于 resumed（响应已合并）时不再重复合并。
    pub async fn continue_execution(
        self: &Arc<Self>,
        task: &dyn Task,
        execution_id: Option<&str>,
        state: SuspendedState,
        tool_response: Value,
    ) -> Result<Value, EngineError> {
        let merged = state.status == SuspendedStatus::Resumed;
        let mut ctx = TaskContext::from_state(
            Arc::clone(self),
            execution_id.map(str::to_string),
            &state,
        );

        match task.resumption() {
            Resumption::Hooks(hooks) => {
                hooks.restore_context(&mut ctx, &state);
                if !merged {
                    hooks.integrate_tool_response(&mut ctx, tool_response);
                }
                let index = ctx.step_index;
                tracing::debug!(identity = %state.identity, index, "Continuing task from step");
                hooks.continue_from_step(&mut ctx, index).await
            }
            Resumption::Rerun => {
                if !merged {
                    ctx.integrate(tool_response);
                }
                tracing::debug!(identity = %state.identity, "Re-running task with merged context");
                task.run(&mut ctx).await
            }
        }
    }

    pub async fn get_execution(&self, id: &str) -> Option<Execution> {
        self.executions.read().await.get(id).cloned()
    }

    pub async fn get_active_executions(&self) -> Vec<Execution> {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .cloned()
            .collect()
    }

    /// 取消 Execution：标记 failed、关闭在途 Step、清理其挂起状态，并中断在途调用。
    /// 已处于终态时返回 Ok(false)
    pub async fn cancel_execution(&self, id: &str) -> Result<bool, EngineError> {
        let open_identity = {
            let mut executions = self.executions.write().await;
            let execution = executions
                .get_mut(id)
                .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;
            if !execution.transition(ExecutionStatus::Failed) {
                return Ok(false);
            }
            execution.error = Some(EngineError::Cancelled.to_string());
            let open = execution.open_step().map(|s| (s.index, s.identity.clone()));
            if let Some((index, _)) = open {
                execution.close_step(index, StepStatus::Failed, None, Some("cancelled".to_string()));
            }
            open.map(|(_, identity)| identity)
        };
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        let token = self.lock_live().get(id).map(|live| live.token.clone());
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(identity) = open_identity {
            self.dispatcher.remove_listener(&identity).await;
            self.store.clear(&identity, SuspendedStatus::Failed).await;
        }
        tracing::info!(execution = %id, "Execution cancelled");
        Ok(true)
    }

    /// 取消全部运行中的 Execution，返回取消数量
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<ExecutionId> = self
            .get_active_executions()
            .await
            .into_iter()
            .map(|e| e.id)
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Ok(true) = self.cancel_execution(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// 回收结束时间早于 max_age 的终态 Execution；运行中的不回收。
    /// 同一时长之前退役的 identity 记录一并丢弃
    pub async fn reap_executions(&self, max_age: Duration) -> usize {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let reaped = {
            let mut executions = self.executions.write().await;
            let before = executions.len();
            executions.retain(|_, e| !(e.is_terminal() && e.ended_at.map(|t| t <= cutoff).unwrap_or(false)));
            before - executions.len()
        };
        let pruned = self.store.prune_retired(max_age).await;
        if reaped > 0 || pruned > 0 {
            tracing::info!(reaped, pruned, "Reaped finished executions");
        }
        reaped
    }

    /// 按配置的保留时长回收
    pub async fn reap_expired(&self) -> usize {
        self.reap_executions(self.settings.reap_after).await
    }

    /// 启动后台回收任务：每隔 every 调用一次 reap_expired，根令牌取消时退出
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let controller = Arc::downgrade(self);
        let token = self.root_token.clone();
        let every = every.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = controller.upgrade() else { break };
                        controller.reap_expired().await;
                    }
                }
            }
            tracing::debug!("Execution reaper stopped");
        })
    }

    pub async fn get_stats(&self) -> EngineStats {
        let active_executions = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .count();
        EngineStats {
            total_executions: self.counters.total.load(Ordering::Relaxed),
            active_executions,
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            active_listeners: self.dispatcher.listener_count().await,
            pending_events: self.dispatcher.pending_events().await,
            suspended_states: self.store.len().await,
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            healthy: !self.root_token.is_cancelled(),
            stats: self.get_stats().await,
            checked_at: now_millis(),
        }
    }

    async fn finish(&self, id: &str, outcome: Result<Value, EngineError>) -> ExecutionResult {
        self.lock_live().remove(id);

        // 总时限到期或被取消时，在途调用的 future 已被丢弃，这里收尾其 Step / 挂起状态
        let open = self
            .executions
            .read()
            .await
            .get(id)
            .and_then(|e| e.open_step().map(|s| (s.index, s.identity.clone())));
        if let Some((index, identity)) = open {
            let timed_out = matches!(&outcome, Err(e) if e.is_timeout());
            if timed_out {
                self.dispatcher.on_timeout(&identity).await;
            } else {
                self.dispatcher.remove_listener(&identity).await;
            }
            self.store.clear(&identity, SuspendedStatus::Failed).await;
            let (status, reason) = if timed_out {
                (StepStatus::Timeout, "execution deadline exceeded")
            } else {
                (StepStatus::Failed, "execution aborted")
            };
            if let Some(execution) = self.executions.write().await.get_mut(id) {
                execution.close_step(index, status, None, Some(reason.to_string()));
            }
        }

        let mut executions = self.executions.write().await;
        let Some(execution) = executions.get_mut(id) else {
            let mut placeholder = Execution::new("unknown", Value::Null);
            placeholder.id = id.to_string();
            placeholder.status = ExecutionStatus::Failed;
            placeholder.error = Some(EngineError::ExecutionNotFound(id.to_string()).to_string());
            return ExecutionResult::from_execution(&placeholder);
        };

        match outcome {
            // 已被 cancel_execution 终结
            _ if execution.is_terminal() => {}
            Ok(value) => {
                if execution.transition(ExecutionStatus::Completing)
                    && execution.transition(ExecutionStatus::Completed)
                {
                    execution.result = Some(value);
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                let status = if e.is_timeout() {
                    ExecutionStatus::Timeout
                } else {
                    ExecutionStatus::Failed
                };
                if execution.transition(status) {
                    execution.error = Some(e.to_string());
                    let counter = if e.is_timeout() {
                        &self.counters.timed_out
                    } else {
                        &self.counters.failed
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let result = ExecutionResult::from_execution(execution);
        tracing::info!(
            execution = %id,
            status = ?execution.status,
            steps = execution.steps.len(),
            duration_ms = result.metadata.duration_ms,
            "Execution finished"
        );
        result
    }

    async fn begin_step(
        &self,
        exec_id: &str,
        identity: &str,
        tool_name: &str,
        request: &Value,
    ) -> Result<(usize, SuspendedContext), EngineError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(exec_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(exec_id.to_string()))?;
        if execution.is_terminal() {
            return Err(EngineError::Cancelled);
        }
        let index = execution
            .begin_step(identity.to_string(), tool_name, request.clone())
            .ok_or_else(|| EngineError::StepInProgress(exec_id.to_string()))?;
        let context = SuspendedContext {
            results: execution.results.clone(),
            step_index: index,
            request: execution.request.clone(),
        };
        execution.transition(ExecutionStatus::Waiting);
        Ok((index, context))
    }

    async fn settle_step(&self, exec_id: &str, index: usize, result: &Result<Value, EngineError>) {
        let mut executions = self.executions.write().await;
        let Some(execution) = executions.get_mut(exec_id) else {
            return;
        };
        let closed = match result {
            Ok(response) => execution.close_step(index, StepStatus::Completed, Some(response.clone()), None),
            Err(e) if e.is_timeout() => execution.close_step(index, StepStatus::Timeout, None, Some(e.to_string())),
            Err(e) => execution.close_step(index, StepStatus::Failed, None, Some(e.to_string())),
        };
        if closed {
            if let Ok(response) = result {
                execution.results.push(response.clone());
            }
        }
        if execution.status == ExecutionStatus::Waiting {
            execution.transition(ExecutionStatus::Running);
        }
    }

    async fn record_attempt(&self, exec_id: &str, index: usize, attempts: u32) {
        if let Some(step) = self
            .executions
            .write()
            .await
            .get_mut(exec_id)
            .and_then(|e| e.steps.get_mut(index))
        {
            step.attempts = attempts;
        }
    }

    fn effective_tool_timeout(&self, deadline: Option<Instant>) -> Duration {
        match deadline {
            Some(deadline) if self.settings.clamp_tool_timeout => self
                .settings
                .tool_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            _ => self.settings.tool_timeout,
        }
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, LiveExecution>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
