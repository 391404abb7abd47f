//! 执行状态存储
//!
//! 按 identity 保存一次外部调用在途期间的挂起状态，并负责每个 identity 的单次超时计时器。
//! 计时器触发时把状态标记为 timeout，并通过 oneshot 通知等待方（不使用回调对）。
//! 找不到 identity 一律返回 NotFound，调用方据此判断「已处理过，不要重复恢复」。
//! 被移除的 identity 记入退役表，不可再次 save。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio::task::AbortHandle;

use crate::core::EngineError;
use crate::execution::types::{Identity, SuspendedContext, SuspendedState, SuspendedStatus};

/// 已启动的计时器；generation 用于区分重新武装前后的计时器
struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Slots {
    live: HashMap<Identity, SuspendedState>,
    /// 已移除的 identity 及其退役时间
    retired: HashMap<Identity, Instant>,
}

impl Slots {
    fn retire(&mut self, identity: &str) -> Option<SuspendedState> {
        let removed = self.live.remove(identity);
        if removed.is_some() {
            self.retired.insert(identity.to_string(), Instant::now());
        }
        removed
    }
}

/// 挂起状态存储（进程内、按 identity 独立）
#[derive(Default)]
pub struct ExecutionStateStore {
    states: RwLock<Slots>,
    timers: Mutex<HashMap<Identity, ArmedTimer>>,
    generation: AtomicU64,
}

impl ExecutionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存挂起状态（status = waiting），返回存入的记录
    pub async fn save(
        &self,
        identity: &str,
        context: SuspendedContext,
        pending_tool: impl Into<String>,
        pending_request: Value,
    ) -> Result<SuspendedState, EngineError> {
        if identity.trim().is_empty() {
            return Err(EngineError::InvalidIdentity);
        }
        let state = SuspendedState::new(
            identity,
            context,
            Some(pending_tool.into()),
            Some(pending_request),
        );

        let mut states = self.states.write().await;
        if states.live.contains_key(identity) {
            return Err(EngineError::DuplicateIdentity(identity.to_string()));
        }
        if states.retired.contains_key(identity) {
            return Err(EngineError::RetiredIdentity(identity.to_string()));
        }
        states.live.insert(identity.to_string(), state.clone());
        tracing::debug!(identity, tool = ?state.pending_tool, "Suspended state saved");
        Ok(state)
    }

    /// 读取挂起状态；不存在时返回 NotFound
    pub async fn restore(&self, identity: &str) -> Result<SuspendedState, EngineError> {
        self.states
            .read()
            .await
            .live
            .get(identity)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(identity.to_string()))
    }

    /// 与 restore 相同，但以 Option 表示缺失
    pub async fn get_state(&self, identity: &str) -> Option<SuspendedState> {
        self.states.read().await.live.get(identity).cloned()
    }

    /// 将响应合并进保存的上下文：追加结果、推进步序号、清除待调用标记、标记 resumed
    pub async fn update_with_response(
        &self,
        identity: &str,
        response: Value,
    ) -> Result<SuspendedState, EngineError> {
        let mut states = self.states.write().await;
        let state = states
            .live
            .get_mut(identity)
            .ok_or_else(|| EngineError::NotFound(identity.to_string()))?;
        state.apply_response(response);
        Ok(state.clone())
    }

    /// 原子地合并响应并移除状态；并发恢复时只有一方能拿到状态。
    /// 计时器已标记 timeout 的状态保持原样并返回 WaitTimedOut，由调用方走超时路径
    pub async fn resume(
        &self,
        identity: &str,
        response: Value,
    ) -> Result<SuspendedState, EngineError> {
        let mut state = {
            let mut states = self.states.write().await;
            match states.live.get(identity) {
                None => return Err(EngineError::NotFound(identity.to_string())),
                Some(state) if state.status == SuspendedStatus::Timeout => {
                    return Err(EngineError::WaitTimedOut(identity.to_string()));
                }
                Some(_) => {}
            }
            states
                .retire(identity)
                .ok_or_else(|| EngineError::NotFound(identity.to_string()))?
        };
        self.cancel_timeout(identity);
        state.apply_response(response);
        tracing::debug!(
            identity,
            wait_ms = state.wait_duration_ms(),
            "Suspended state resumed"
        );
        Ok(state)
    }

    /// 原子地移除状态并返回（附带最终状态）；同时取消仍在计时的超时
    pub async fn take(&self, identity: &str, final_status: SuspendedStatus) -> Option<SuspendedState> {
        let removed = self.states.write().await.retire(identity);
        self.cancel_timeout(identity);
        removed.map(|mut state| {
            state.status = final_status;
            tracing::debug!(identity, status = ?final_status, "Suspended state cleared");
            state
        })
    }

    /// 移除状态并取消计时器；幂等，未知 identity 不是错误。返回是否确实移除了状态
    pub async fn clear(&self, identity: &str, final_status: SuspendedStatus) -> bool {
        self.take(identity, final_status).await.is_some()
    }

    /// 启动单次超时计时器；同一 identity 再次调用会先取消旧计时器（重新武装，而非叠加）。
    ///
    /// 触发时：若状态仍存在且处于 waiting，则标记为 timeout；随后通过返回的 Receiver 送出 identity。
    /// 计时器被取消（clear / 重新武装）时 Receiver 收到 RecvError。
    pub fn start_timeout(
        self: &Arc<Self>,
        identity: &str,
        duration: Duration,
    ) -> oneshot::Receiver<Identity> {
        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let store: Weak<Self> = Arc::downgrade(self);
        let id = identity.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(store) = store.upgrade() {
                if store.mark_timed_out(&id).await {
                    tracing::warn!(identity = %id, timeout_ms = duration.as_millis() as u64, "Suspended state timed out");
                }
                store.forget_timer(&id, generation);
            }
            let _ = tx.send(id);
        })
        .abort_handle();

        let mut timers = self.lock_timers();
        if let Some(previous) = timers.insert(identity.to_string(), ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
        rx
    }

    /// 取消计时器，返回是否存在过
    pub fn cancel_timeout(&self, identity: &str) -> bool {
        match self.lock_timers().remove(identity) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// 纯时间检查：自保存以来是否已超过 duration（与计时器是否已触发无关）；状态不存在时为 false
    pub async fn check_timeout(&self, identity: &str, duration: Duration) -> bool {
        self.states
            .read()
            .await
            .live
            .get(identity)
            .map(|state| state.elapsed() >= duration)
            .unwrap_or(false)
    }

    /// 计时器是否已把该状态标记为 timeout
    pub async fn is_timed_out(&self, identity: &str) -> bool {
        self.states
            .read()
            .await
            .live
            .get(identity)
            .map(|state| state.status == SuspendedStatus::Timeout)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.live.is_empty()
    }

    pub async fn is_retired(&self, identity: &str) -> bool {
        self.states.read().await.retired.contains_key(identity)
    }

    pub async fn retired_len(&self) -> usize {
        self.states.read().await.retired.len()
    }

    /// 丢弃退役超过 max_age 的 identity 记录，返回丢弃数量
    pub async fn prune_retired(&self, max_age: Duration) -> usize {
        let mut states = self.states.write().await;
        let before = states.retired.len();
        states.retired.retain(|_, retired_at| retired_at.elapsed() < max_age);
        before - states.retired.len()
    }

    pub fn armed_timers(&self) -> usize {
        self.lock_timers().len()
    }

    async fn mark_timed_out(&self, identity: &str) -> bool {
        let mut states = self.states.write().await;
        match states.live.get_mut(identity) {
            Some(state) if state.status == SuspendedStatus::Waiting => {
                state.status = SuspendedStatus::Timeout;
                true
            }
            _ => false,
        }
    }

    fn forget_timer(&self, identity: &str, generation: u64) {
        let mut timers = self.lock_timers();
        if timers.get(identity).map(|t| t.generation) == Some(generation) {
            timers.remove(identity);
        }
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<Identity, ArmedTimer>> {
        // 计时器表只做插入/删除，持锁期间不会 panic；被毒化时沿用内部数据
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
