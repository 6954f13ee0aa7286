//! Error types for the codecall sandbox.

use codecall_error::{ErrorKind, ErrorPayload};
use thiserror::Error;

/// Errors that end a sandbox execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code failed validation checks.
    #[error("code validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. Scripts reach registered functions through `functions.<name>(...)` or `codecall.call(name, ...)` only")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The submitted code does not parse.
    #[error("syntax error: {message}")]
    Syntax {
        /// Parser diagnostic.
        message: String,
    },

    /// The script raised an exception that it did not catch.
    #[error("{message}")]
    Script {
        /// The exception message.
        message: String,
        /// The exception stack, if the thrown value carried one.
        stack: Option<String>,
    },

    /// A function call failed and the script let the failure propagate.
    #[error("{0}")]
    Call(ErrorPayload),

    /// Execution result exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// Execution timed out (event loop budget or CPU-bound watchdog).
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// The session was cancelled while the script was running.
    #[error("execution cancelled")]
    Cancelled,

    /// Generic execution failure inside the runtime.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// The taxonomy kind reported for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed { .. }
            | Self::CodeTooLarge { .. }
            | Self::BannedPattern { .. }
            | Self::Syntax { .. }
            | Self::Script { .. }
            | Self::OutputTooLarge { .. }
            | Self::HeapLimitExceeded => ErrorKind::ScriptError,
            Self::Call(payload) => payload.kind,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::CancellationRequested,
            Self::Execution(_) | Self::Serialization(_) => ErrorKind::InternalError,
        }
    }

    /// Convert into the payload delivered to the client.
    ///
    /// Internal faults are reported with a generic message; the detail is
    /// only logged.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Call(payload) => payload.clone(),
            Self::Script { message, stack } => {
                ErrorPayload::new(ErrorKind::ScriptError, message.clone()).with_stack(stack.clone())
            }
            Self::Execution(_) | Self::Serialization(_) => {
                ErrorPayload::new(ErrorKind::InternalError, "internal runtime error")
            }
            other => ErrorPayload::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_level_failures_are_script_errors() {
        let errors = [
            SandboxError::ValidationFailed {
                reason: "code is empty".into(),
            },
            SandboxError::CodeTooLarge { max: 1, actual: 2 },
            SandboxError::BannedPattern {
                pattern: "eval(".into(),
            },
            SandboxError::Syntax {
                message: "Unexpected token".into(),
            },
            SandboxError::OutputTooLarge { max: 10 },
            SandboxError::HeapLimitExceeded,
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::ScriptError, "{err}");
        }
    }

    #[test]
    fn call_errors_keep_their_kind() {
        let err = SandboxError::Call(ErrorPayload::new(
            ErrorKind::UnknownFunction,
            "unknown function: 'nope'",
        ));
        assert_eq!(err.kind(), ErrorKind::UnknownFunction);
        assert_eq!(err.to_payload().message, "unknown function: 'nope'");
    }

    #[test]
    fn script_payload_carries_stack() {
        let err = SandboxError::Script {
            message: "Error: boom".into(),
            stack: Some("Error: boom\n    at <anonymous>:3:11".into()),
        };
        let payload = err.to_payload();
        assert_eq!(payload.kind, ErrorKind::ScriptError);
        assert!(payload.stack.unwrap().contains("<anonymous>"));
    }

    #[test]
    fn internal_errors_are_not_leaked() {
        let err = SandboxError::Execution(anyhow::anyhow!("thread spawn failed at /srv/x"));
        let payload = err.to_payload();
        assert_eq!(payload.kind, ErrorKind::InternalError);
        assert!(!payload.message.contains("/srv"));
    }

    #[test]
    fn timeout_and_cancel_kinds() {
        assert_eq!(
            SandboxError::Timeout { timeout_ms: 5 }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            SandboxError::Cancelled.kind(),
            ErrorKind::CancellationRequested
        );
    }
}
