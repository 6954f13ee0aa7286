//! RPC dispatch channel between a script and the function host.
//!
//! Every call a script makes becomes a [`CallForward`] tagged with
//! `(session_id, call_id)` and a pending entry in the shared [`CallTable`].
//! The host answers with a [`CallResult`] carrying the same ids. Results are
//! matched strictly by id, never by issue order.
//!
//! A pending entry is removed by whichever of completion, abandonment, or
//! session teardown reaches it first. Removal is the only transition to a
//! terminal state, so a call completes exactly once and anything arriving
//! later is discarded.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use codecall_error::{CallError, ErrorKind, ErrorPayload};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::audit::{sha256_hex, CallAudit};

/// Identifier of a session, unique per runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a call, unique within its session.
pub type CallId = u32;

/// A call travelling from the script to the function host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallForward {
    /// Owning session.
    pub session_id: SessionId,
    /// Correlation id.
    pub call_id: CallId,
    /// Target function name.
    pub function_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

/// How a call ended on the host side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    /// The function returned this value.
    Value(Value),
    /// The call failed.
    Error(ErrorPayload),
}

/// The host's answer to a [`CallForward`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    /// Owning session.
    pub session_id: SessionId,
    /// Correlation id, echoed from the forward.
    pub call_id: CallId,
    /// Value or error.
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

impl CallResult {
    /// A successful result.
    pub fn value(session_id: SessionId, call_id: CallId, value: Value) -> Self {
        Self {
            session_id,
            call_id,
            outcome: CallOutcome::Value(value),
        }
    }

    /// A failed result.
    pub fn error(session_id: SessionId, call_id: CallId, error: ErrorPayload) -> Self {
        Self {
            session_id,
            call_id,
            outcome: CallOutcome::Error(error),
        }
    }
}

/// Lifecycle state of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Issued, waiting for the host.
    Pending,
    /// Completed with a value.
    Resolved,
    /// Completed with an error.
    Errored,
    /// Dropped before the host answered; any later answer is discarded.
    Abandoned,
}

/// Per-session limits enforced at the channel boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimits {
    /// Maximum calls a session may issue.
    pub max_calls: usize,
    /// Maximum serialized size of one call's arguments, in bytes.
    pub max_args_size: usize,
    /// Maximum serialized size of one call's result, in bytes.
    pub max_result_size: usize,
    /// Maximum nesting depth of arguments and results.
    pub max_depth: usize,
}

impl Default for CallLimits {
    fn default() -> Self {
        Self {
            max_calls: 256,
            max_args_size: 1024 * 1024,       // 1 MB
            max_result_size: 4 * 1024 * 1024, // 4 MB
            max_depth: 64,
        }
    }
}

/// Nesting depth of a JSON value. Scalars have depth 0.
pub fn value_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn abandoned_payload(function: &str) -> ErrorPayload {
    CallError::Abandoned {
        function: function.to_string(),
    }
    .to_payload()
}

struct PendingCall {
    function: String,
    args_hash: String,
    issued: Instant,
    tx: oneshot::Sender<CallOutcome>,
    audit: Option<mpsc::UnboundedSender<CallAudit>>,
}

impl PendingCall {
    fn finish(self, call_id: CallId, state: CallState, outcome: CallOutcome) {
        if let Some(audit) = &self.audit {
            let error_kind = match &outcome {
                CallOutcome::Error(p) => Some(p.kind),
                CallOutcome::Value(_) => None,
            };
            let _ = audit.send(CallAudit {
                call_id,
                function: self.function.clone(),
                args_hash: self.args_hash.clone(),
                duration_ms: self.issued.elapsed().as_millis() as u64,
                state,
                error_kind,
            });
        }
        // The handle may already be gone; the outcome is then dropped.
        let _ = self.tx.send(outcome);
    }
}

/// The pending-call table shared by all sessions of a runtime.
#[derive(Default)]
pub struct CallTable {
    pending: DashMap<(SessionId, CallId), PendingCall>,
    discarded: AtomicU64,
}

impl CallTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        session_id: SessionId,
        call_id: CallId,
        function: &str,
        args_hash: String,
        audit: Option<mpsc::UnboundedSender<CallAudit>>,
    ) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            (session_id, call_id),
            PendingCall {
                function: function.to_string(),
                args_hash,
                issued: Instant::now(),
                tx,
                audit,
            },
        );
        rx
    }

    /// Deliver a host result.
    ///
    /// Returns the terminal state the call reached, or `None` when the call
    /// is unknown or already terminal. Such results are discarded.
    pub fn complete(&self, result: CallResult) -> Option<CallState> {
        let Some((_, pending)) = self.pending.remove(&(result.session_id, result.call_id)) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                session_id = %result.session_id,
                call_id = result.call_id,
                "late or unknown call result discarded"
            );
            return None;
        };
        let state = match &result.outcome {
            CallOutcome::Value(_) => CallState::Resolved,
            CallOutcome::Error(_) => CallState::Errored,
        };
        tracing::debug!(
            session_id = %result.session_id,
            call_id = result.call_id,
            function = %pending.function,
            state = ?state,
            "call completed"
        );
        pending.finish(result.call_id, state, result.outcome);
        Some(state)
    }

    /// Abandon one call. Returns `false` if it was already terminal.
    pub fn abandon(&self, session_id: SessionId, call_id: CallId) -> bool {
        match self.pending.remove(&(session_id, call_id)) {
            Some((_, pending)) => {
                let payload = abandoned_payload(&pending.function);
                pending.finish(call_id, CallState::Abandoned, CallOutcome::Error(payload));
                true
            }
            None => false,
        }
    }

    /// Abandon every pending call of a session. Returns how many were
    /// abandoned.
    pub fn abandon_session(&self, session_id: SessionId) -> usize {
        let keys: Vec<_> = self
            .pending
            .iter()
            .filter(|e| e.key().0 == session_id)
            .map(|e| *e.key())
            .collect();
        let abandoned = keys
            .into_iter()
            .filter(|(_, call_id)| self.abandon(session_id, *call_id))
            .count();
        if abandoned > 0 {
            tracing::debug!(session_id = %session_id, abandoned, "abandoned in-flight calls");
        }
        abandoned
    }

    /// Number of pending calls owned by `session_id`.
    pub fn pending_for(&self, session_id: SessionId) -> usize {
        self.pending.iter().filter(|e| e.key().0 == session_id).count()
    }

    /// Total pending calls across sessions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no calls are pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Results discarded because their call was unknown or already terminal.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

struct ClientInner {
    session_id: SessionId,
    table: Arc<CallTable>,
    forward: mpsc::UnboundedSender<CallForward>,
    limits: CallLimits,
    next_call: AtomicU32,
    issued: AtomicUsize,
    cancel: CancellationToken,
    audit: Option<mpsc::UnboundedSender<CallAudit>>,
}

/// The only route from a script context to registered functions.
///
/// A client is bound to one session. Cloning shares the call counter and
/// limits.
#[derive(Clone)]
pub struct DispatchClient {
    inner: Arc<ClientInner>,
}

impl DispatchClient {
    /// Bind a client to `session_id`, forwarding calls into `forward`.
    pub fn new(
        session_id: SessionId,
        table: Arc<CallTable>,
        forward: mpsc::UnboundedSender<CallForward>,
        limits: CallLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_audit(session_id, table, forward, limits, cancel, None)
    }

    /// Like [`new`](Self::new), also reporting every finished call to `audit`.
    pub fn with_audit(
        session_id: SessionId,
        table: Arc<CallTable>,
        forward: mpsc::UnboundedSender<CallForward>,
        limits: CallLimits,
        cancel: CancellationToken,
        audit: Option<mpsc::UnboundedSender<CallAudit>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session_id,
                table,
                forward,
                limits,
                next_call: AtomicU32::new(1),
                issued: AtomicUsize::new(0),
                cancel,
                audit,
            }),
        }
    }

    /// The session this client belongs to.
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// Calls issued so far.
    pub fn issued(&self) -> usize {
        self.inner.issued.load(Ordering::Relaxed)
    }

    /// Issue a call and return a handle that resolves with its outcome.
    ///
    /// Fails without contacting the host when the session is cancelled, the
    /// call limit is reached, or the arguments exceed the size or depth
    /// limits.
    pub fn call(&self, function: &str, args: Vec<Value>) -> Result<CallHandle, CallError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let limits = inner.limits;
        let args_json = serde_json::to_string(&args).map_err(|e| CallError::InvalidArguments {
            function: function.to_string(),
            reason: format!("arguments are not serializable: {e}"),
        })?;
        if args_json.len() > limits.max_args_size {
            return Err(CallError::InvalidArguments {
                function: function.to_string(),
                reason: format!(
                    "arguments too large ({} bytes, max {} bytes)",
                    args_json.len(),
                    limits.max_args_size
                ),
            });
        }
        let depth = args.iter().map(value_depth).max().unwrap_or(0);
        if depth > limits.max_depth {
            return Err(CallError::InvalidArguments {
                function: function.to_string(),
                reason: format!("arguments nest too deeply (max depth {})", limits.max_depth),
            });
        }

        let reserved = inner
            .issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limits.max_calls).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(CallError::LimitExceeded {
                max: limits.max_calls,
            });
        }

        let call_id = inner.next_call.fetch_add(1, Ordering::Relaxed);
        let rx = inner.table.register(
            inner.session_id,
            call_id,
            function,
            sha256_hex(&args_json),
            inner.audit.clone(),
        );

        tracing::debug!(
            session_id = %inner.session_id,
            call_id,
            function,
            args_len = args_json.len(),
            "call dispatched"
        );

        let forward = CallForward {
            session_id: inner.session_id,
            call_id,
            function_name: function.to_string(),
            args,
        };
        if inner.forward.send(forward).is_err() {
            inner.table.abandon(inner.session_id, call_id);
            return Err(CallError::Internal(anyhow::anyhow!(
                "function host is not running"
            )));
        }

        Ok(CallHandle {
            session_id: inner.session_id,
            call_id,
            function: function.to_string(),
            rx,
            cancelled: Box::pin(inner.cancel.clone().cancelled_owned()),
            table: inner.table.clone(),
            done: false,
        })
    }
}

/// An issued call. Resolves with the call's value or error payload.
///
/// Cancelling the session resolves the handle with
/// `CancellationRequested` and abandons the call. Dropping an unfinished
/// handle abandons the call too.
pub struct CallHandle {
    session_id: SessionId,
    call_id: CallId,
    function: String,
    rx: oneshot::Receiver<CallOutcome>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    table: Arc<CallTable>,
    done: bool,
}

impl CallHandle {
    /// The call's correlation id.
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// The target function.
    pub fn function(&self) -> &str {
        &self.function
    }
}

impl Future for CallHandle {
    type Output = Result<Value, ErrorPayload>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(outcome) = Pin::new(&mut this.rx).poll(cx) {
            this.done = true;
            return Poll::Ready(match outcome {
                Ok(CallOutcome::Value(v)) => Ok(v),
                Ok(CallOutcome::Error(p)) => Err(p),
                Err(_) => Err(abandoned_payload(&this.function)),
            });
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            this.table.abandon(this.session_id, this.call_id);
            return Poll::Ready(Err(ErrorPayload::new(
                ErrorKind::CancellationRequested,
                format!("session cancelled while '{}' was in flight", this.function),
            )));
        }
        Poll::Pending
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.done {
            self.table.abandon(self.session_id, self.call_id);
        }
    }
}

/// Wait for every handle. Outcomes are returned in handle order,
/// regardless of the order results arrive in.
pub async fn wait_all(handles: Vec<CallHandle>) -> Vec<Result<Value, ErrorPayload>> {
    futures::future::join_all(handles).await
}

/// Wait for the first handle to finish.
///
/// Returns its index, its outcome, and the still-pending handles, or `None`
/// when `handles` is empty.
#[allow(clippy::type_complexity)]
pub async fn wait_any(
    handles: Vec<CallHandle>,
) -> Option<(usize, Result<Value, ErrorPayload>, Vec<CallHandle>)> {
    if handles.is_empty() {
        return None;
    }
    let (outcome, index, rest) = futures::future::select_all(handles).await;
    Some((index, outcome, rest))
}
