//! 事件分发器
//!
//! 把「工具结束了」与「接下来做什么」解耦：按 identity 注册续体（Listener），
//! 响应 / 错误 / 超时事件到达时找到对应续体并恢复，保证每个 identity 至多恢复一次。
//!
//! 每个 identity 的状态机：registered → (response | error | timeout) → consumed。
//! consumed 之后到达的事件一律返回 Expired，不是错误。超时与迟到的成功竞争时超时获胜。

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::core::EngineError;
use crate::execution::state_store::ExecutionStateStore;
use crate::execution::types::{now_millis, Identity, SuspendedState, SuspendedStatus};

/// 成功续体：收到工具响应，返回回调结果
pub type SuccessCallback = Box<dyn FnOnce(Value) -> Result<Value, String> + Send>;
/// 错误续体：收到 ToolError 或 ToolTimeout
pub type ErrorCallback = Box<dyn FnOnce(EngineError) -> Result<Value, String> + Send>;
/// 全局观察者（日志 / 指标钩子），失败会被吞掉
pub type Observer = Arc<dyn Fn(&Event, &DispatchOutcome) -> Result<(), String> + Send + Sync>;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Response,
    Error,
    Timeout,
}

/// 事件优先级：错误 / 超时优先于普通响应
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EventPriority {
    Normal = 0,
    Critical = 1,
}

/// 某个在途调用上发生的事情（不持久化）
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub identity: Identity,
    pub payload: Value,
    pub timestamp: i64,
    pub priority: EventPriority,
}

impl Event {
    pub fn new(kind: EventKind, identity: impl Into<Identity>, payload: Value) -> Self {
        let priority = match kind {
            EventKind::Response => EventPriority::Normal,
            EventKind::Error | EventKind::Timeout => EventPriority::Critical,
        };
        Self {
            kind,
            identity: identity.into(),
            payload,
            timestamp: now_millis(),
            priority,
        }
    }

    pub fn response(identity: impl Into<Identity>, payload: Value) -> Self {
        Self::new(EventKind::Response, identity, payload)
    }

    pub fn error(identity: impl Into<Identity>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, identity, Value::String(message.into()))
    }

    pub fn timeout(identity: impl Into<Identity>) -> Self {
        Self::new(EventKind::Timeout, identity, Value::Null)
    }

    fn message(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Listener 选项
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// 等待上限；只用于判定「是否已超时」，不负责启动计时器
    pub timeout: Option<Duration>,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

impl ListenerOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_error = max_retries > 0;
        self.max_retries = max_retries;
        self
    }
}

/// 某个 identity 的续体
pub struct Listener {
    pub identity: Identity,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    pub registered_at: i64,
    pub options: ListenerOptions,
    retries: u32,
}

impl Listener {
    fn new(identity: &str, options: ListenerOptions) -> Self {
        Self {
            identity: identity.to_string(),
            on_success: None,
            on_error: None,
            registered_at: now_millis(),
            options,
            retries: 0,
        }
    }
}

/// 分发结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// 响应已合并，续体已执行
    Resumed,
    /// 终态错误（工具错误或回调失败）
    Failed,
    TimedOut,
    /// 状态已不存在：已被处理或已放弃
    Expired,
    /// Listener 要求重试，等待仍在继续
    RetryRequested,
}

/// process_event 的结构化结果
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub identity: Identity,
    pub status: OutcomeStatus,
    pub state: Option<SuspendedState>,
    pub callback_result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl DispatchOutcome {
    fn new(identity: &str, status: OutcomeStatus) -> Self {
        Self {
            identity: identity.to_string(),
            status,
            state: None,
            callback_result: None,
            error: None,
            retry_count: 0,
        }
    }

    fn expired(identity: &str) -> Self {
        let mut outcome = Self::new(identity, OutcomeStatus::Expired);
        outcome.error = Some("state expired".to_string());
        outcome
    }

    pub fn success(&self) -> bool {
        self.status == OutcomeStatus::Resumed
    }

    pub fn is_expired(&self) -> bool {
        self.status == OutcomeStatus::Expired
    }

    pub fn retry(&self) -> bool {
        self.status == OutcomeStatus::RetryRequested
    }

    pub fn timed_out(&self) -> bool {
        self.status == OutcomeStatus::TimedOut
    }
}

/// subscribe 返回的一次性结果
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Response(Value),
    Error(String),
    Timeout,
}

/// 分发器统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub active_listeners: usize,
    pub pending_events: usize,
    pub events_processed: u64,
    pub expired: u64,
    pub retries: u64,
}

struct QueuedEvent {
    seq: u64,
    event: Event,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // 大顶堆：优先级高者先出，同优先级先入先出
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.event.priority, Reverse(self.seq)).cmp(&(other.event.priority, Reverse(other.seq)))
    }
}

/// 事件分发器：续体注册表 + 优先级事件队列
pub struct EventDispatcher {
    store: Arc<ExecutionStateStore>,
    listeners: Mutex<HashMap<Identity, Listener>>,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    observers: RwLock<HashMap<EventKind, Vec<Observer>>>,
    next_seq: AtomicU64,
    processed: AtomicU64,
    expired: AtomicU64,
    retries: AtomicU64,
}

impl EventDispatcher {
    pub fn new(store: Arc<ExecutionStateStore>) -> Self {
        Self {
            store,
            listeners: Mutex::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            observers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<ExecutionStateStore> {
        &self.store
    }

    /// 注册成功续体；同一 identity 重复注册时后注册者覆盖（保留已挂的错误回调）
    pub async fn register_continuation<F>(&self, identity: &str, on_success: F, options: ListenerOptions)
    where
        F: FnOnce(Value) -> Result<Value, String> + Send + 'static,
    {
        let mut listeners = self.listeners.lock().await;
        let previous_error = match listeners.remove(identity) {
            Some(previous) => {
                tracing::debug!(identity, "Overwriting existing continuation");
                previous.on_error
            }
            None => None,
        };
        let mut listener = Listener::new(identity, options);
        listener.on_success = Some(Box::new(on_success));
        listener.on_error = previous_error;
        listeners.insert(identity.to_string(), listener);
    }

    /// 挂载（或创建）错误续体，与成功续体相互独立
    pub async fn register_error_handler<F>(&self, identity: &str, on_error: F)
    where
        F: FnOnce(EngineError) -> Result<Value, String> + Send + 'static,
    {
        let mut listeners = self.listeners.lock().await;
        listeners
            .entry(identity.to_string())
            .or_insert_with(|| Listener::new(identity, ListenerOptions::default()))
            .on_error = Some(Box::new(on_error));
    }

    /// 以 oneshot 通道代替回调：事件到达后通过 Receiver 得到一次性结果
    pub async fn subscribe(&self, identity: &str, options: ListenerOptions) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(std::sync::Mutex::new(Some(tx)));
        let error_slot = Arc::clone(&slot);

        let mut listener = Listener::new(identity, options);
        listener.on_success = Some(Box::new(move |response: Value| {
            send_resolution(&slot, Resolution::Response(response.clone()));
            Ok(response)
        }));
        listener.on_error = Some(Box::new(move |err: EngineError| {
            let resolution = if err.is_timeout() {
                Resolution::Timeout
            } else {
                Resolution::Error(err.to_string())
            };
            send_resolution(&error_slot, resolution);
            Ok(Value::Null)
        }));

        self.listeners.lock().await.insert(identity.to_string(), listener);
        rx
    }

    pub async fn has_listener(&self, identity: &str) -> bool {
        self.listeners.lock().await.contains_key(identity)
    }

    pub async fn remove_listener(&self, identity: &str) -> bool {
        self.listeners.lock().await.remove(identity).is_some()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// 当前重试计数（无 Listener 时为 0）
    pub async fn retry_count(&self, identity: &str) -> u32 {
        self.listeners
            .lock()
            .await
            .get(identity)
            .map(|l| l.retries)
            .unwrap_or(0)
    }

    /// 全局观察者：每处理一个该类型的事件调用一次
    pub async fn add_observer(&self, kind: EventKind, observer: Observer) {
        self.observers.write().await.entry(kind).or_default().push(observer);
    }

    pub async fn on_response(&self, identity: &str, response: Value) -> DispatchOutcome {
        self.process_event(Event::response(identity, response)).await
    }

    pub async fn on_error(&self, identity: &str, error: impl Into<String>) -> DispatchOutcome {
        self.process_event(Event::error(identity, error)).await
    }

    pub async fn on_timeout(&self, identity: &str) -> DispatchOutcome {
        self.process_event(Event::timeout(identity)).await
    }

    /// 处理一个事件：
    /// 1. 等待已超时则无论事件类型都走超时路径
    /// 2. 状态不存在则返回 Expired
    /// 3. 按类型分发给对应处理器
    /// 4. 调用观察者（失败被吞掉）
    pub async fn process_event(&self, event: Event) -> DispatchOutcome {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let identity = event.identity.clone();

        let mut kind = event.kind;
        if kind != EventKind::Timeout && self.wait_timed_out(&identity).await {
            tracing::warn!(identity = %identity, event = ?event.kind, "Wait already timed out, escalating to timeout");
            kind = EventKind::Timeout;
        }

        let outcome = match self.store.restore(&identity).await {
            Err(_) => DispatchOutcome::expired(&identity),
            Ok(state) => match kind {
                EventKind::Response => self.handle_response(&event).await,
                EventKind::Error => self.handle_error(&event, state).await,
                EventKind::Timeout => self.handle_timeout(&identity, state).await,
            },
        };

        if outcome.is_expired() {
            self.expired.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(identity = %identity, event = ?event.kind, "Event for expired state ignored");
        }

        self.notify_observers(kind, &event, &outcome).await;
        outcome
    }

    /// 暂存事件，稍后按优先级处理；返回队列长度
    pub async fn enqueue_event(&self, event: Event) -> usize {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock().await;
        queue.push(QueuedEvent { seq, event });
        queue.len()
    }

    /// 取出并处理优先级最高的事件；队列为空时返回 None
    pub async fn process_next_event(&self) -> Option<DispatchOutcome> {
        let next = self.queue.lock().await.pop();
        match next {
            Some(queued) => Some(self.process_event(queued.event).await),
            None => None,
        }
    }

    /// 按优先级处理队列中的全部事件
    pub async fn drain_events(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next_event().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn pending_events(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            active_listeners: self.listener_count().await,
            pending_events: self.pending_events().await,
            events_processed: self.processed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    async fn wait_timed_out(&self, identity: &str) -> bool {
        if self.store.is_timed_out(identity).await {
            return true;
        }
        let limit = self
            .listeners
            .lock()
            .await
            .get(identity)
            .and_then(|l| l.options.timeout);
        match limit {
            Some(limit) => self.store.check_timeout(identity, limit).await,
            None => false,
        }
    }

    async fn handle_response(&self, event: &Event) -> DispatchOutcome {
        let identity = event.identity.as_str();
        // resume 是原子的：并发的第二个事件在这里拿不到状态
        let state = match self.store.resume(identity, event.payload.clone()).await {
            Ok(state) => state,
            // 计时器在超时检查之后才触发：超时仍然获胜
            Err(e) if e.is_timeout() => {
                tracing::warn!(identity, "Timer fired before resume, escalating to timeout");
                return match self.store.restore(identity).await {
                    Ok(restored) => self.handle_timeout(identity, restored).await,
                    Err(_) => DispatchOutcome::expired(identity),
                };
            }
            Err(_) => return DispatchOutcome::expired(identity),
        };
        let listener = self.listeners.lock().await.remove(identity);

        let mut outcome = DispatchOutcome::new(identity, OutcomeStatus::Resumed);
        outcome.state = Some(state);
        if let Some(listener) = listener {
            outcome.retry_count = listener.retries;
            if let Some(callback) = listener.on_success {
                match callback(event.payload.clone()) {
                    Ok(value) => outcome.callback_result = Some(value),
                    Err(e) => {
                        tracing::warn!(identity, error = %e, "Continuation failed");
                        outcome.status = OutcomeStatus::Failed;
                        outcome.error = Some(EngineError::CallbackError(e).to_string());
                    }
                }
            }
        }
        outcome
    }

    async fn handle_error(&self, event: &Event, state: SuspendedState) -> DispatchOutcome {
        let identity = event.identity.as_str();
        let message = event.message();

        {
            let mut listeners = self.listeners.lock().await;
            if let Some(listener) = listeners.get_mut(identity) {
                if listener.options.retry_on_error && listener.retries < listener.options.max_retries {
                    listener.retries += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(identity, retry = listener.retries, "Retry requested");
                    let mut outcome = DispatchOutcome::new(identity, OutcomeStatus::RetryRequested);
                    outcome.retry_count = listener.retries;
                    outcome.error = Some(message);
                    outcome.state = Some(state);
                    return outcome;
                }
            }
        }

        let Some(state) = self.store.take(identity, SuspendedStatus::Failed).await else {
            return DispatchOutcome::expired(identity);
        };
        let listener = self.listeners.lock().await.remove(identity);

        let mut outcome = DispatchOutcome::new(identity, OutcomeStatus::Failed);
        outcome.state = Some(state);
        outcome.error = Some(message.clone());
        if let Some(listener) = listener {
            outcome.retry_count = listener.retries;
            if let Some(callback) = listener.on_error {
                match callback(EngineError::ToolError(message)) {
                    Ok(value) => outcome.callback_result = Some(value),
                    Err(e) => {
                        tracing::warn!(identity, error = %e, "Error continuation failed");
                        outcome.error = Some(EngineError::CallbackError(e).to_string());
                    }
                }
            }
        }
        outcome
    }

    async fn handle_timeout(&self, identity: &str, restored: SuspendedState) -> DispatchOutcome {
        let Some(state) = self.store.take(identity, SuspendedStatus::Timeout).await else {
            return DispatchOutcome::expired(identity);
        };
        let listener = self.listeners.lock().await.remove(identity);
        let tool = restored.pending_tool.unwrap_or_else(|| identity.to_string());

        let mut outcome = DispatchOutcome::new(identity, OutcomeStatus::TimedOut);
        outcome.error = Some(EngineError::ToolTimeout(tool.clone()).to_string());
        outcome.state = Some(state);
        if let Some(listener) = listener {
            outcome.retry_count = listener.retries;
            if let Some(callback) = listener.on_error {
                match callback(EngineError::ToolTimeout(tool)) {
                    Ok(value) => outcome.callback_result = Some(value),
                    Err(e) => {
                        tracing::warn!(identity, error = %e, "Timeout continuation failed");
                        outcome.error = Some(EngineError::CallbackError(e).to_string());
                    }
                }
            }
        }
        outcome
    }

    async fn notify_observers(&self, kind: EventKind, event: &Event, outcome: &DispatchOutcome) {
        let observers = match self.observers.read().await.get(&kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for observer in observers {
            if let Err(e) = observer(event, outcome) {
                tracing::warn!(identity = %event.identity, error = %e, "Observer failed");
            }
        }
    }
}

fn send_resolution(slot: &std::sync::Mutex<Option<oneshot::Sender<Resolution>>>, resolution: Resolution) {
    let sender = slot.lock().ok().and_then(|mut guard| guard.take());
    if let Some(tx) = sender {
        let _ = tx.send(resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::SuspendedContext;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn setup(identities: &[&str]) -> (Arc<ExecutionStateStore>, EventDispatcher) {
        let store = Arc::new(ExecutionStateStore::new());
        for id in identities {
            store
                .save(id, SuspendedContext::default(), "search", json!({"q": "x"}))
                .await
                .unwrap();
        }
        let dispatcher = EventDispatcher::new(Arc::clone(&store));
        (store, dispatcher)
    }

    #[tokio::test]
    async fn test_continuation_receives_response_once() {
        let (_store, dispatcher) = setup(&["Y"]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(std::sync::Mutex::new(None));

        let (c, r) = (Arc::clone(&calls), Arc::clone(&received));
        dispatcher
            .register_continuation(
                "Y",
                move |resp| {
                    c.fetch_add(1, Ordering::SeqCst);
                    *r.lock().unwrap() = Some(resp.clone());
                    Ok(resp)
                },
                ListenerOptions::default(),
            )
            .await;

        let outcome = dispatcher.on_response("Y", json!({"data": 42})).await;
        assert!(outcome.success());
        assert_eq!(outcome.callback_result, Some(json!({"data": 42})));
        assert_eq!(*received.lock().unwrap(), Some(json!({"data": 42})));
        assert!(!dispatcher.has_listener("Y").await);

        let again = dispatcher.on_response("Y", json!({"data": 43})).await;
        assert!(again.is_expired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_at_most_once_response_then_timeout() {
        let (_store, dispatcher) = setup(&["A"]).await;
        let first = dispatcher.on_response("A", json!(1)).await;
        let second = dispatcher.on_timeout("A").await;
        assert!(first.success());
        assert!(second.is_expired());
    }

    #[tokio::test]
    async fn test_at_most_once_timeout_then_response() {
        let (_store, dispatcher) = setup(&["A"]).await;
        let first = dispatcher.on_timeout("A").await;
        let second = dispatcher.on_response("A", json!(1)).await;
        assert!(first.timed_out());
        assert!(second.is_expired());
    }

    #[tokio::test]
    async fn test_concurrent_events_resume_once() {
        let (_store, dispatcher) = setup(&["C"]).await;
        let dispatcher = Arc::new(dispatcher);
        let a = tokio::spawn({
            let d = Arc::clone(&dispatcher);
            async move { d.on_response("C", json!(1)).await }
        });
        let b = tokio::spawn({
            let d = Arc::clone(&dispatcher);
            async move { d.on_timeout("C").await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let expired = [&a, &b].iter().filter(|o| o.is_expired()).count();
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn test_fired_timer_beats_late_success() {
        let (store, dispatcher) = setup(&["T"]).await;
        let fired = store.start_timeout("T", Duration::from_millis(10));
        fired.await.unwrap();

        let late = dispatcher.on_response("T", json!("late")).await;
        assert!(late.timed_out());
        assert!(!late.success());

        let timeout_event = dispatcher.on_timeout("T").await;
        assert!(timeout_event.is_expired());
    }

    #[tokio::test]
    async fn test_timer_landing_after_check_still_wins() {
        let (store, dispatcher) = setup(&["T"]).await;
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        dispatcher
            .register_continuation("T", |v| Ok(v), ListenerOptions::default())
            .await;
        dispatcher
            .register_error_handler("T", move |e| {
                assert!(e.is_timeout());
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await;

        // 直接进入响应处理，模拟计时器恰好在超时检查之后触发
        store
            .start_timeout("T", Duration::from_millis(10))
            .await
            .unwrap();
        let late = dispatcher.handle_response(&Event::response("T", json!("late"))).await;

        assert!(late.timed_out());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(store.get_state("T").await.is_none());
        assert!(!dispatcher.has_listener("T").await);
    }

    #[tokio::test]
    async fn test_retired_identity_never_resumes_again() {
        let (store, dispatcher) = setup(&["R"]).await;
        store.clear("R", SuspendedStatus::Completed).await;
        assert!(store
            .save("R", SuspendedContext::default(), "search", json!({}))
            .await
            .is_err());

        let stale = dispatcher.on_response("R", json!("stale")).await;
        assert!(stale.is_expired());
    }

    #[tokio::test]
    async fn test_listener_timeout_option_escalates() {
        let (_store, dispatcher) = setup(&["L"]).await;
        dispatcher
            .register_continuation(
                "L",
                |v| Ok(v),
                ListenerOptions::default().with_timeout(Duration::from_millis(20)),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let outcome = dispatcher.on_response("L", json!(1)).await;
        assert!(outcome.timed_out());
        assert!(!dispatcher.has_listener("L").await);
    }

    #[tokio::test]
    async fn test_retry_on_error_until_exhausted() {
        let (_store, dispatcher) = setup(&["Z"]).await;
        let error_calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&error_calls);
        dispatcher
            .register_continuation("Z", |v| Ok(v), ListenerOptions::default().with_retries(2))
            .await;
        dispatcher
            .register_error_handler("Z", move |_err| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await;

        let first = dispatcher.on_error("Z", "boom").await;
        assert!(first.retry());
        assert_eq!(first.retry_count, 1);

        let second = dispatcher.on_error("Z", "boom").await;
        assert!(second.retry());
        assert_eq!(second.retry_count, 2);

        let third = dispatcher.on_error("Z", "boom").await;
        assert_eq!(third.status, OutcomeStatus::Failed);
        assert!(!third.retry());
        assert_eq!(third.error.as_deref(), Some("boom"));
        assert!(!dispatcher.has_listener("Z").await);
        assert_eq!(error_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites_previous() {
        let (_store, dispatcher) = setup(&["O"]).await;
        let first_calls = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&first_calls);
        dispatcher
            .register_continuation(
                "O",
                move |v| {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(v)
                },
                ListenerOptions::default(),
            )
            .await;
        dispatcher
            .register_continuation("O", |_| Ok(json!("second")), ListenerOptions::default())
            .await;
        assert_eq!(dispatcher.listener_count().await, 1);

        let outcome = dispatcher.on_response("O", json!(1)).await;
        assert_eq!(outcome.callback_result, Some(json!("second")));
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_listener_is_tolerated() {
        let (_store, dispatcher) = setup(&["N"]).await;
        let outcome = dispatcher.on_response("N", json!(7)).await;
        assert!(outcome.success());
        assert!(outcome.callback_result.is_none());
        assert_eq!(outcome.state.unwrap().context.results, vec![json!(7)]);
    }

    #[tokio::test]
    async fn test_callback_error_becomes_failed_outcome() {
        let (store, dispatcher) = setup(&["E"]).await;
        dispatcher
            .register_continuation("E", |_| Err("bad continuation".into()), ListenerOptions::default())
            .await;
        let outcome = dispatcher.on_response("E", json!(1)).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.error.unwrap().contains("bad continuation"));
        assert!(store.get_state("E").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_resolution() {
        let (_store, dispatcher) = setup(&["S", "S2"]).await;
        let rx = dispatcher.subscribe("S", ListenerOptions::default()).await;
        dispatcher.on_response("S", json!({"ok": true})).await;
        assert_eq!(rx.await.unwrap(), Resolution::Response(json!({"ok": true})));

        let rx = dispatcher.subscribe("S2", ListenerOptions::default()).await;
        dispatcher.on_timeout("S2").await;
        assert_eq!(rx.await.unwrap(), Resolution::Timeout);
    }

    #[tokio::test]
    async fn test_queue_orders_critical_first() {
        let (_store, dispatcher) = setup(&["q1", "q2", "q3"]).await;
        dispatcher.enqueue_event(Event::response("q1", json!(1))).await;
        dispatcher.enqueue_event(Event::response("q2", json!(2))).await;
        dispatcher.enqueue_event(Event::error("q3", "down")).await;
        assert_eq!(dispatcher.pending_events().await, 3);

        let order: Vec<String> = dispatcher
            .drain_events()
            .await
            .into_iter()
            .map(|o| o.identity)
            .collect();
        assert_eq!(order, vec!["q3", "q1", "q2"]);
        assert_eq!(dispatcher.pending_events().await, 0);
        assert!(dispatcher.process_next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_observer_failures_are_swallowed() {
        let (_store, dispatcher) = setup(&["W"]).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        dispatcher
            .add_observer(
                EventKind::Response,
                Arc::new(|_: &Event, _: &DispatchOutcome| Err("observer down".to_string())),
            )
            .await;
        dispatcher
            .add_observer(
                EventKind::Response,
                Arc::new(move |_: &Event, outcome: &DispatchOutcome| {
                    assert!(outcome.success());
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        let outcome = dispatcher.on_response("W", json!(1)).await;
        assert!(outcome.success());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.stats().await.events_processed, 1);
    }
}
