//! Session coordinator: admission, lifecycle, and cancellation.
//!
//! Every session gets its own script context through
//! [`SandboxEngine::run`]. The coordinator bounds how many run at once,
//! queues or rejects the overflow, and keeps a small
//! tombstone per finished session so `status` and `cancel` stay answerable
//! after the context is gone.
//!
//! A session's state becomes terminal exactly once. `cancel` and
//! `connection_lost` make it terminal immediately and then tell the engine
//! to stop; the engine's own result is recorded only if nothing else got
//! there first.
//!
//! A queued session takes its place in line inside `create`, before any
//! task is spawned, so slots are handed out strictly in creation order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use codecall_error::{ErrorKind, ErrorPayload};
use codecall_sandbox::{ExecutionResult, SandboxEngine, SessionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// What happens to sessions created while the runtime is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a slot, in arrival order.
    #[default]
    Queue,
    /// Fail immediately with `Overloaded`.
    Reject,
}

/// Coordinator limits.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum concurrently running sessions.
    pub max_concurrent: usize,
    /// Behaviour once `max_concurrent` sessions are running.
    pub overflow: OverflowPolicy,
    /// Finished sessions kept for `status` and `cancel`, oldest evicted first.
    pub retained: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            overflow: OverflowPolicy::Queue,
            retained: 1024,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for a free slot.
    Queued,
    /// The script is running.
    Running,
    /// The script produced a value.
    Completed,
    /// The session ended with an error.
    Failed,
    /// The session was cancelled.
    Cancelled,
    /// The connection that submitted the session went away.
    ConnectionLost,
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    fn of(result: &ExecutionResult) -> Self {
        match result.kind() {
            None => Self::Completed,
            Some(ErrorKind::CancellationRequested) => Self::Cancelled,
            Some(ErrorKind::ConnectionLost) => Self::ConnectionLost,
            Some(_) => Self::Failed,
        }
    }
}

/// A session's state and, once it has ended, its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// The terminal result, once there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

/// Errors from coordinator operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live or retained session has this id.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// All slots are busy and the overflow policy is `Reject`.
    #[error("runtime is at capacity ({max} concurrent sessions)")]
    Overloaded {
        /// Configured maximum.
        max: usize,
    },
}

impl SessionError {
    /// The taxonomy kind reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::InvalidArguments,
            Self::Overloaded { .. } => ErrorKind::Overloaded,
        }
    }

    /// Convert into the payload delivered to the client.
    pub fn to_payload(&self) -> ErrorPayload {
        let payload = ErrorPayload::new(self.kind(), self.to_string());
        match self {
            Self::Overloaded { .. } => {
                payload.with_suggestion(Some("Retry after running sessions finish".into()))
            }
            Self::NotFound(_) => payload,
        }
    }
}

/// Live session counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    /// Sessions waiting for a slot.
    pub queued: usize,
    /// Sessions holding a slot.
    pub running: usize,
    /// Finished sessions still answering `status`.
    pub retained: usize,
}

/// A created session. Resolves with its terminal result.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    result: oneshot::Receiver<ExecutionResult>,
}

impl SessionHandle {
    /// The session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for the terminal result.
    pub async fn result(self) -> ExecutionResult {
        self.result.await.unwrap_or_else(|_| {
            ExecutionResult::error(ErrorPayload::new(
                ErrorKind::InternalError,
                "session driver exited without a result",
            ))
        })
    }
}

struct SessionRecord {
    state: SessionState,
    cancel: CancellationToken,
    result: Option<ExecutionResult>,
}

/// Creates, tracks, and cancels sessions.
pub struct SessionCoordinator {
    engine: Arc<SandboxEngine>,
    config: CoordinatorConfig,
    slots: Arc<Slots>,
    next_id: AtomicU64,
    sessions: DashMap<SessionId, SessionRecord>,
    retired: Mutex<VecDeque<SessionId>>,
}

impl SessionCoordinator {
    /// Create a coordinator that runs sessions on `engine`.
    pub fn new(engine: Arc<SandboxEngine>, config: CoordinatorConfig) -> Self {
        Self {
            slots: Slots::new(config.max_concurrent),
            engine,
            config,
            next_id: AtomicU64::new(1),
            sessions: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
        }
    }

    /// The engine sessions run on.
    pub fn engine(&self) -> &Arc<SandboxEngine> {
        &self.engine
    }

    /// The coordinator's limits.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Create a session for `code` and start it, or queue it if every slot
    /// is busy.
    ///
    /// Fails with [`SessionError::Overloaded`] when every slot is busy and
    /// the policy is [`OverflowPolicy::Reject`].
    pub fn create(self: &Arc<Self>, code: String) -> Result<SessionHandle, SessionError> {
        let admission = match self.config.overflow {
            OverflowPolicy::Queue => self.slots.enqueue(),
            OverflowPolicy::Reject => match self.slots.try_take() {
                Some(slot) => Admission::Ready(slot),
                None => {
                    tracing::warn!(
                        max_concurrent = self.config.max_concurrent,
                        "session rejected: at capacity"
                    );
                    return Err(SessionError::Overloaded {
                        max: self.config.max_concurrent,
                    });
                }
            },
        };

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let state = match admission {
            Admission::Ready(_) => SessionState::Running,
            Admission::Queued(_) => SessionState::Queued,
        };
        self.sessions.insert(
            id,
            SessionRecord {
                state,
                cancel: cancel.clone(),
                result: None,
            },
        );
        tracing::debug!(session_id = %id, state = ?state, "session created");

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.drive(id, code, cancel, admission).await;
            let _ = tx.send(result);
        });
        Ok(SessionHandle { id, result: rx })
    }

    async fn drive(
        &self,
        id: SessionId,
        code: String,
        cancel: CancellationToken,
        admission: Admission,
    ) -> ExecutionResult {
        let _slot = match admission {
            Admission::Ready(slot) => slot,
            Admission::Queued(turn) => {
                let granted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    slot = turn => slot.ok(),
                };
                match granted {
                    Some(slot) => slot,
                    None => return self.finish(id, interrupted(ErrorKind::CancellationRequested)),
                }
            }
        };

        if !self.mark_running(id) {
            return self.finish(id, interrupted(ErrorKind::CancellationRequested));
        }
        let result = self.engine.run(&code, id, cancel).await;
        self.finish(id, result)
    }

    fn mark_running(&self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(mut record) if record.result.is_none() => {
                record.state = SessionState::Running;
                true
            }
            _ => false,
        }
    }

    /// Record `result` unless the session already ended; return the result
    /// that stands.
    fn finish(&self, id: SessionId, result: ExecutionResult) -> ExecutionResult {
        let (settled, newly) = {
            let Some(mut record) = self.sessions.get_mut(&id) else {
                return result;
            };
            match &record.result {
                Some(existing) => (existing.clone(), false),
                None => {
                    record.state = SessionState::of(&result);
                    record.result = Some(result.clone());
                    (result, true)
                }
            }
        };
        if newly {
            self.retire(id);
        }
        settled
    }

    /// End a live session with `state`. No-op on finished sessions.
    fn interrupt(
        &self,
        id: SessionId,
        state: SessionState,
        kind: ErrorKind,
    ) -> Result<SessionState, SessionError> {
        let (current, newly) = {
            let mut record = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
            if record.result.is_some() {
                (record.state, false)
            } else {
                record.state = state;
                record.result = Some(interrupted(kind));
                record.cancel.cancel();
                (state, true)
            }
        };
        if newly {
            tracing::info!(session_id = %id, state = ?state, "session interrupted");
            self.retire(id);
        }
        Ok(current)
    }

    /// Cancel a session and return the state it ends up in.
    ///
    /// Idempotent: cancelling a finished session changes nothing and
    /// reports its existing terminal state.
    pub fn cancel(&self, id: SessionId) -> Result<SessionState, SessionError> {
        self.interrupt(id, SessionState::Cancelled, ErrorKind::CancellationRequested)
    }

    /// Mark a session's connection as gone.
    ///
    /// A live session ends as `ConnectionLost` and its context and calls are
    /// released; a finished one is left alone.
    pub fn connection_lost(&self, id: SessionId) -> Result<SessionState, SessionError> {
        self.interrupt(id, SessionState::ConnectionLost, ErrorKind::ConnectionLost)
    }

    /// Report a session's state.
    pub fn status(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        let record = self.sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        Ok(SessionStatus {
            state: record.state,
            result: record.result.clone(),
        })
    }

    /// Cancel every live session. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let live: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|r| r.result.is_none())
            .map(|r| *r.key())
            .collect();
        live.into_iter()
            .filter(|id| matches!(self.cancel(*id), Ok(SessionState::Cancelled)))
            .count()
    }

    /// Current session counts.
    pub fn counts(&self) -> SessionCounts {
        let mut counts = SessionCounts::default();
        for record in self.sessions.iter() {
            match record.state {
                SessionState::Queued => counts.queued += 1,
                SessionState::Running => counts.running += 1,
                _ => counts.retained += 1,
            }
        }
        counts
    }

    /// Queue a finished session for eviction, dropping the oldest beyond
    /// the retention limit.
    fn retire(&self, id: SessionId) {
        let evicted: Vec<SessionId> = {
            let mut retired = self.retired.lock();
            retired.push_back(id);
            let excess = retired.len().saturating_sub(self.config.retained);
            retired.drain(..excess).collect()
        };
        for old in evicted {
            self.sessions.remove(&old);
        }
    }
}

/// Running-session slots, handed out in the order they were asked for.
///
/// Invariant: `free > 0` only while `waiting` is empty.
struct Slots {
    state: Mutex<SlotState>,
}

struct SlotState {
    free: usize,
    waiting: VecDeque<oneshot::Sender<Slot>>,
}

/// A held slot. Dropping it passes the slot to the next live waiter.
struct Slot {
    slots: Option<Arc<Slots>>,
}

enum Admission {
    Ready(Slot),
    Queued(oneshot::Receiver<Slot>),
}

impl Slots {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                free: max,
                waiting: VecDeque::new(),
            }),
        })
    }

    fn try_take(self: &Arc<Self>) -> Option<Slot> {
        let mut state = self.state.lock();
        if state.free == 0 {
            return None;
        }
        state.free -= 1;
        Some(Slot {
            slots: Some(self.clone()),
        })
    }

    /// Take a slot now, or a place at the back of the line.
    fn enqueue(self: &Arc<Self>) -> Admission {
        let mut state = self.state.lock();
        if state.free > 0 {
            state.free -= 1;
            return Admission::Ready(Slot {
                slots: Some(self.clone()),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.waiting.push_back(tx);
        Admission::Queued(rx)
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(tx) = state.waiting.pop_front() {
            if tx.is_closed() {
                continue;
            }
            drop(state);
            match tx.send(Slot {
                slots: Some(self.clone()),
            }) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // The waiter left after the check; keep looking.
                    unclaimed.slots = None;
                    state = self.state.lock();
                }
            }
        }
        state.free += 1;
    }

    #[cfg(test)]
    fn free(&self) -> usize {
        self.state.lock().free
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            slots.release();
        }
    }
}

fn interrupted(kind: ErrorKind) -> ExecutionResult {
    let message = match kind {
        ErrorKind::ConnectionLost => "connection lost while the session was running",
        _ => "session cancelled",
    };
    ExecutionResult::error(ErrorPayload::new(kind, message))
}
