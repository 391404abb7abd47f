//! Execution / Step / SuspendedState 数据模型
//!
//! Execution 是一次完整任务尝试的扁平记录：状态单调前进（waiting ⇄ running 循环除外），
//! steps 只追加；进入终态后不再变化。

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution ID（exec_<uuid>）
pub type ExecutionId = String;

/// 单次外部调用的唯一标识（Suspended State 与 Listener 共用）
pub type Identity = String;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Execution 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initializing,
    Running,
    /// 正在等待某个外部工具返回
    Waiting,
    Completing,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// 合法转移：initializing → running → (waiting ⇄ running)* → completing → 终态；
    /// 任何非终态都可以直接进入 failed / timeout
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) | (_, Timeout) => true,
            (Initializing, Running) => true,
            (Running, Waiting) | (Running, Completing) => true,
            (Waiting, Running) => true,
            (Completing, Completed) => true,
            _ => false,
        }
    }
}

/// Step 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
    Timeout,
}

/// 一次外部工具调用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub identity: Identity,
    pub tool: String,
    pub request: Value,
    pub status: StepStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub response: Option<Value>,
    pub error: Option<String>,
    /// 执行次数（含错误重试）
    pub attempts: u32,
}

impl Step {
    pub fn is_open(&self) -> bool {
        self.status == StepStatus::Started
    }
}

/// 一次完整的任务执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// 任务类型标签
    pub kind: String,
    pub status: ExecutionStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub steps: Vec<Step>,
    pub results: Vec<Value>,
    /// 原始请求
    pub request: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Execution {
    pub fn new(kind: impl Into<String>, request: Value) -> Self {
        Self {
            id: format!("exec_{}", uuid::Uuid::new_v4()),
            kind: kind.into(),
            status: ExecutionStatus::Initializing,
            started_at: now_millis(),
            ended_at: None,
            steps: Vec::new(),
            results: Vec::new(),
            request,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 尝试状态转移；非法转移被忽略并返回 false
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                execution = %self.id,
                from = ?self.status,
                to = ?next,
                "Rejected execution status transition"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(now_millis());
        }
        true
    }

    pub fn open_step(&self) -> Option<&Step> {
        self.steps.iter().rev().find(|s| s.is_open())
    }

    /// 追加一个 started 状态的 Step，返回其下标；已有未关闭的 Step 时返回 None
    pub fn begin_step(&mut self, identity: Identity, tool: &str, request: Value) -> Option<usize> {
        if self.open_step().is_some() {
            return None;
        }
        let index = self.steps.len();
        self.steps.push(Step {
            index,
            identity,
            tool: tool.to_string(),
            request,
            status: StepStatus::Started,
            started_at: now_millis(),
            ended_at: None,
            response: None,
            error: None,
            attempts: 1,
        });
        Some(index)
    }

    /// 关闭 Step；已关闭的 Step 保持原状（例如先被标记为 timeout）
    pub fn close_step(
        &mut self,
        index: usize,
        status: StepStatus,
        response: Option<Value>,
        error: Option<String>,
    ) -> bool {
        match self.steps.get_mut(index) {
            Some(step) if step.is_open() => {
                step.status = status;
                step.ended_at = Some(now_millis());
                step.response = response;
                step.error = error;
                true
            }
            _ => false,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(now_millis);
        (end - self.started_at).max(0) as u64
    }
}

/// 挂起状态的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendedStatus {
    Waiting,
    Timeout,
    Resumed,
    Completed,
    Failed,
}

/// 挂起期间保存的任务上下文快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspendedContext {
    /// 之前各步的结果
    pub results: Vec<Value>,
    /// 当前步序号
    pub step_index: usize,
    /// 原始请求
    pub request: Value,
}

/// 一次外部调用在途时的挂起状态
#[derive(Debug, Clone)]
pub struct SuspendedState {
    pub identity: Identity,
    pub status: SuspendedStatus,
    pub context: SuspendedContext,
    pub pending_tool: Option<String>,
    pub pending_request: Option<Value>,
    pub saved_at: i64,
    pub resumed_at: Option<i64>,
    saved_instant: Instant,
}

impl SuspendedState {
    pub fn new(
        identity: impl Into<Identity>,
        context: SuspendedContext,
        pending_tool: Option<String>,
        pending_request: Option<Value>,
    ) -> Self {
        Self {
            identity: identity.into(),
            status: SuspendedStatus::Waiting,
            context,
            pending_tool,
            pending_request,
            saved_at: now_millis(),
            resumed_at: None,
            saved_instant: Instant::now(),
        }
    }

    /// 合并工具响应：追加结果、推进步序号、清除待调用标记
    pub fn apply_response(&mut self, response: Value) {
        self.context.results.push(response);
        self.context.step_index += 1;
        self.pending_tool = None;
        self.pending_request = None;
        self.status = SuspendedStatus::Resumed;
        self.resumed_at = Some(now_millis());
    }

    /// 等待时长：已恢复则为保存到恢复的间隔，否则为至今的间隔
    pub fn wait_duration_ms(&self) -> u64 {
        match self.resumed_at {
            Some(resumed) => (resumed - self.saved_at).max(0) as u64,
            None => self.saved_instant.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn elapsed(&self) -> std::time::Duration {
        self.saved_instant.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use ExecutionStatus::*;
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Waiting.can_transition_to(Timeout));
        assert!(Completing.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Initializing));
        assert!(!Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Timeout.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_execution_is_frozen() {
        let mut exec = Execution::new("plan", json!({}));
        assert!(exec.transition(ExecutionStatus::Running));
        assert!(exec.transition(ExecutionStatus::Failed));
        assert!(exec.ended_at.is_some());
        assert!(!exec.transition(ExecutionStatus::Running));
        assert_eq!(exec.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_only_one_open_step() {
        let mut exec = Execution::new("plan", json!({}));
        assert_eq!(exec.begin_step("a".into(), "search", json!({})), Some(0));
        assert_eq!(exec.begin_step("b".into(), "search", json!({})), None);
        assert!(exec.close_step(0, StepStatus::Completed, Some(json!(1)), None));
        assert_eq!(exec.begin_step("b".into(), "search", json!({})), Some(1));
    }

    #[test]
    fn test_closed_step_is_not_overwritten() {
        let mut exec = Execution::new("plan", json!({}));
        exec.begin_step("a".into(), "search", json!({}));
        assert!(exec.close_step(0, StepStatus::Timeout, None, Some("timeout".into())));
        assert!(!exec.close_step(0, StepStatus::Completed, Some(json!(1)), None));
        assert_eq!(exec.steps[0].status, StepStatus::Timeout);
    }

    #[test]
    fn test_apply_response_advances_context() {
        let mut state = SuspendedState::new(
            "id",
            SuspendedContext {
                results: vec![json!(1)],
                step_index: 1,
                request: json!({"q": "x"}),
            },
            Some("search".into()),
            Some(json!({"q": "x"})),
        );
        state.apply_response(json!(2));
        assert_eq!(state.context.results, vec![json!(1), json!(2)]);
        assert_eq!(state.context.step_index, 2);
        assert!(state.pending_tool.is_none());
        assert!(state.pending_request.is_none());
        assert_eq!(state.status, SuspendedStatus::Resumed);
        assert!(state.resumed_at.is_some());
    }
}
