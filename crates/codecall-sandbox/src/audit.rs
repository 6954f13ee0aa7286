//! Audit logging for sessions.
//!
//! Every session run emits an [`AuditEntry`] containing:
//! - Execution ID (UUID) and the session id
//! - SHA-256 hash of the code (never raw code in logs)
//! - A redacted preview of the first 500 chars of code
//! - Calls made (with hashed args, not raw) and how each ended
//! - Duration and outcome
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::time::Instant;

use chrono::{DateTime, Utc};
use codecall_error::ErrorKind;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::channel::{CallId, CallState, SessionId};
use crate::error::SandboxError;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record for one session run.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique execution identifier.
    pub execution_id: String,
    /// The session that ran.
    pub session_id: SessionId,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the submitted code.
    pub code_hash: String,
    /// First N characters of the code, redacted.
    pub code_preview: String,
    /// Calls made during the run, in completion order.
    pub calls: Vec<CallAudit>,
    /// Total run duration in milliseconds.
    pub duration_ms: u64,
    /// Size of the serialized result in bytes.
    pub result_size_bytes: usize,
    /// Final outcome.
    pub outcome: AuditOutcome,
}

/// Audit record for one call.
#[derive(Debug, Clone, Serialize)]
pub struct CallAudit {
    /// Correlation id within the session.
    pub call_id: CallId,
    /// Target function.
    pub function: String,
    /// SHA-256 hash of the serialized arguments (args never stored raw).
    pub args_hash: String,
    /// Time from issue to terminal state, in milliseconds.
    pub duration_ms: u64,
    /// Terminal state.
    pub state: CallState,
    /// Error classification when the call did not resolve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// The outcome of a session run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The script produced a value.
    Success,
    /// The run failed.
    Error {
        /// Error classification.
        kind: ErrorKind,
        /// The error message, redacted.
        message: String,
    },
    /// The run exceeded its time budget.
    Timeout,
    /// The run was cancelled.
    Cancelled,
}

impl AuditOutcome {
    /// Short label used in log lines and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error { .. } => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger and return the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits one structured `tracing` event per session.
///
/// Events are logged at `INFO` with `audit = true`. Calls are summarised
/// as counts.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let failed_calls = entry
            .calls
            .iter()
            .filter(|c| c.state != CallState::Resolved)
            .count();
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            session_id = %entry.session_id,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            result_size_bytes = entry.result_size_bytes,
            calls = entry.calls.len(),
            failed_calls,
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    Sha256::digest(data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &code[..end])
}

/// Builder for constructing audit entries during a run.
pub struct AuditEntryBuilder {
    execution_id: String,
    session_id: SessionId,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    calls: Vec<CallAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start building an audit entry.
    pub fn new(session_id: SessionId, code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            session_id,
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: crate::redact::redact_error_message(&code_preview(code)),
            calls: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Record a finished call.
    pub fn record_call(&mut self, audit: CallAudit) {
        self.calls.push(audit);
    }

    /// Finalize the audit entry with the run result.
    pub fn finish(self, result: &Result<serde_json::Value, SandboxError>) -> AuditEntry {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        let (result_size_bytes, outcome) = match result {
            Ok(value) => {
                let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
                (size, AuditOutcome::Success)
            }
            Err(SandboxError::Timeout { .. }) => (0, AuditOutcome::Timeout),
            Err(SandboxError::Cancelled) => (0, AuditOutcome::Cancelled),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    kind: e.kind(),
                    message: crate::redact::redact_error_message(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            session_id: self.session_id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            calls: self.calls,
            duration_ms,
            result_size_bytes,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(state: CallState) -> CallAudit {
        CallAudit {
            call_id: 1,
            function: "double".into(),
            args_hash: sha256_hex("[21]"),
            duration_ms: 3,
            state,
            error_kind: None,
        }
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn code_preview_truncates_on_char_boundary() {
        assert_eq!(code_preview("return 1"), "return 1");

        let code = format!("{}é", "a".repeat(CODE_PREVIEW_MAX - 1));
        let preview = code_preview(&code);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.len(), CODE_PREVIEW_MAX - 1 + 3);
    }

    #[test]
    fn builder_success_records_size_and_calls() {
        let mut builder = AuditEntryBuilder::new(SessionId(9), "return await double(21)");
        builder.record_call(call(CallState::Resolved));
        let entry = builder.finish(&Ok(serde_json::json!(42)));

        assert_eq!(entry.session_id, SessionId(9));
        assert_eq!(entry.result_size_bytes, 2);
        assert_eq!(entry.calls.len(), 1);
        assert!(matches!(entry.outcome, AuditOutcome::Success));
        assert!(Uuid::parse_str(&entry.execution_id).is_ok());
    }

    #[test]
    fn builder_maps_timeout_cancel_and_errors() {
        let timeout = AuditEntryBuilder::new(SessionId(1), "x")
            .finish(&Err(SandboxError::Timeout { timeout_ms: 10 }));
        assert!(matches!(timeout.outcome, AuditOutcome::Timeout));

        let cancelled =
            AuditEntryBuilder::new(SessionId(1), "x").finish(&Err(SandboxError::Cancelled));
        assert_eq!(cancelled.outcome.label(), "cancelled");

        let failed = AuditEntryBuilder::new(SessionId(1), "x").finish(&Err(SandboxError::Script {
            message: "fetch https://internal.example/x failed".into(),
            stack: None,
        }));
        match failed.outcome {
            AuditOutcome::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::ScriptError);
                assert!(message.contains("[url]"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn preview_is_redacted_and_raw_code_is_not_stored() {
        let code = "const key = 'token=abc123secret'; return await fetchAll(key);";
        let entry = AuditEntryBuilder::new(SessionId(1), code).finish(&Ok(serde_json::Value::Null));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("abc123secret"), "{json}");
        assert!(json.contains(&sha256_hex(code)));
    }

    #[tokio::test]
    async fn json_lines_logger_writes_one_line_per_entry() {
        let logger = JsonLinesAuditLogger::new(Vec::<u8>::new());
        let mut builder = AuditEntryBuilder::new(SessionId(4), "return 1");
        builder.record_call(CallAudit {
            error_kind: Some(ErrorKind::UnknownFunction),
            ..call(CallState::Errored)
        });
        let entry = builder.finish(&Ok(serde_json::json!(1)));
        logger.log(&entry).await;
        logger.log(&entry).await;

        let out = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["session_id"], 4);
        assert_eq!(parsed["outcome"], "success");
        assert_eq!(parsed["calls"][0]["state"], "errored");
        assert_eq!(parsed["calls"][0]["error_kind"], "UnknownFunction");
    }

    #[tokio::test]
    async fn tracing_logger_handles_every_outcome() {
        let logger = TracingAuditLogger;
        for result in [
            Ok(serde_json::json!(null)),
            Err(SandboxError::Timeout { timeout_ms: 1 }),
            Err(SandboxError::Cancelled),
            Err(SandboxError::HeapLimitExceeded),
        ] {
            let entry = AuditEntryBuilder::new(SessionId(2), "return 1").finish(&result);
            logger.log(&entry).await;
        }
    }
}
