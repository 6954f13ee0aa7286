//! The sandbox engine: one script run per session.
//!
//! [`SandboxEngine::run`] validates and prepares the code, opens the
//! function host for the session against a registry snapshot, wires both
//! sides through the shared [`CallTable`], executes the script, and tears
//! everything down again. It always yields exactly one [`ExecutionResult`].

use std::sync::Arc;

use codecall_error::{ErrorKind, ErrorPayload};
use codecall_registry::LiveRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntryBuilder, AuditLogger, CallAudit, NoopAuditLogger};
use crate::channel::{
    value_depth, CallLimits, CallOutcome, CallResult, CallTable, DispatchClient, SessionId,
};
use crate::error::SandboxError;
use crate::executor::{self, SandboxConfig};
use crate::script::prepare;
use crate::validator::validate_code;
use crate::FunctionHost;

/// The terminal result of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionResult {
    /// The script produced a value.
    Ok {
        /// The script's return value. `undefined` becomes `null`.
        value: Value,
    },
    /// The session failed.
    Error {
        /// What went wrong.
        error: ErrorPayload,
    },
}

impl ExecutionResult {
    /// A successful result.
    pub fn ok(value: Value) -> Self {
        Self::Ok { value }
    }

    /// A failed result.
    pub fn error(error: ErrorPayload) -> Self {
        Self::Error { error }
    }

    /// Whether the session produced a value.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// The value, if the session succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Ok { value } => Some(value),
            Self::Error { .. } => None,
        }
    }

    /// The error, if the session failed.
    pub fn error_payload(&self) -> Option<&ErrorPayload> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { error } => Some(error),
        }
    }

    /// The error kind, if the session failed.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.error_payload().map(|e| e.kind)
    }
}

impl From<Result<Value, SandboxError>> for ExecutionResult {
    fn from(result: Result<Value, SandboxError>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(e) => Self::error(e.to_payload()),
        }
    }
}

/// Runs scripts against a live registry through a function host.
///
/// `Send + Sync`; sessions may run concurrently. Admission control lives
/// with the caller.
pub struct SandboxEngine {
    config: SandboxConfig,
    registry: LiveRegistry,
    host: Arc<dyn FunctionHost>,
    calls: Arc<CallTable>,
    audit_logger: Arc<dyn AuditLogger>,
}

impl SandboxEngine {
    /// Create an engine.
    pub fn new(
        config: SandboxConfig,
        registry: LiveRegistry,
        host: Arc<dyn FunctionHost>,
    ) -> Self {
        let current = registry.current();
        for name in crate::ops::shadowed_names(&current) {
            tracing::warn!(
                function = %name,
                "function name is a script global, call it as functions.{name}"
            );
        }
        Self {
            config,
            registry,
            host,
            calls: Arc::new(CallTable::new()),
            audit_logger: Arc::new(NoopAuditLogger),
        }
    }

    /// Replace the audit logger.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// The engine's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The registry sessions take their snapshots from.
    pub fn registry(&self) -> &LiveRegistry {
        &self.registry
    }

    /// The pending-call table shared by all sessions.
    pub fn calls(&self) -> &Arc<CallTable> {
        &self.calls
    }

    /// Run `code` as session `session_id`.
    ///
    /// Cancelling `cancel` ends the session with `CancellationRequested`
    /// and abandons its in-flight calls.
    pub async fn run(
        &self,
        code: &str,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(session_id = %session_id, code_len = code.len(), "session started");
        let mut audit = AuditEntryBuilder::new(session_id, code);
        let (audit_tx, mut audit_rx) = mpsc::unbounded_channel();

        let result = self.run_inner(code, session_id, cancel, audit_tx).await;

        while let Ok(call) = audit_rx.try_recv() {
            audit.record_call(call);
        }
        let entry = audit.finish(&result);
        self.audit_logger.log(&entry).await;

        match &result {
            Ok(_) => tracing::info!(session_id = %session_id, "session complete"),
            Err(e) if e.kind() == ErrorKind::InternalError => {
                tracing::error!(session_id = %session_id, error = %e, "session failed internally")
            }
            Err(e) => tracing::info!(
                session_id = %session_id,
                kind = %e.kind(),
                error = %e,
                "session ended with error"
            ),
        }
        result.into()
    }

    async fn run_inner(
        &self,
        code: &str,
        session_id: SessionId,
        cancel: CancellationToken,
        audit_tx: mpsc::UnboundedSender<CallAudit>,
    ) -> Result<Value, SandboxError> {
        validate_code(code, Some(self.config.max_code_size))?;
        let script = prepare(code)?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let registry = self.registry.current();
        let limits = self.config.call_limits();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let host = self
            .host
            .open(session_id, registry, results_tx, cancel.child_token())
            .await?;
        let router = tokio::spawn(route_results(results_rx, self.calls.clone(), limits));

        let client = DispatchClient::with_audit(
            session_id,
            self.calls.clone(),
            host.forward(),
            limits,
            cancel.clone(),
            Some(audit_tx),
        );
        let result = executor::execute(&self.config, script, client, cancel).await;

        self.calls.abandon_session(session_id);
        host.close();
        router.abort();
        result
    }
}

/// Deliver host results to the call table, enforcing result limits.
async fn route_results(
    mut results: mpsc::UnboundedReceiver<CallResult>,
    calls: Arc<CallTable>,
    limits: CallLimits,
) {
    while let Some(mut result) = results.recv().await {
        if let CallOutcome::Value(value) = &result.outcome {
            if let Some(reason) = result_violation(value, &limits) {
                result.outcome =
                    CallOutcome::Error(ErrorPayload::new(ErrorKind::FunctionError, reason));
            }
        }
        calls.complete(result);
    }
}

fn result_violation(value: &Value, limits: &CallLimits) -> Option<String> {
    let size = match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len(),
        Err(e) => return Some(format!("function result is not serializable: {e}")),
    };
    if size > limits.max_result_size {
        return Some(format!(
            "function result too large ({size} bytes, max {} bytes)",
            limits.max_result_size
        ));
    }
    if value_depth(value) > limits.max_depth {
        return Some(format!(
            "function result nests too deeply (max depth {})",
            limits.max_depth
        ));
    }
    None
}
