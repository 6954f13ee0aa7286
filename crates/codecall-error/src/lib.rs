#![warn(missing_docs)]

//! # codecall-error
//!
//! Error taxonomy for the codecall runtime.
//!
//! Every failure that can reach a client is classified by an [`ErrorKind`]
//! and travels as an [`ErrorPayload`]. Failures of a single dispatched call
//! are represented by [`CallError`], which the sandbox surfaces to script
//! code as a catchable `CallError` carrying the same kind.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of every error the runtime reports.
///
/// The serialized form (`"UnknownFunction"`, `"Timeout"`, ...) is part of the
/// wire protocol and the script-visible `CallError.kind` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The function registry could not be built. Fatal at startup.
    RegistrationError,
    /// A script called a name the registry does not declare.
    UnknownFunction,
    /// Call arguments failed validation against the declared parameter types.
    InvalidArguments,
    /// The script itself raised, failed to parse, or broke a sandbox limit.
    ScriptError,
    /// A registered function implementation raised.
    FunctionError,
    /// The session exceeded its wall-clock budget.
    Timeout,
    /// The transport carrying the session dropped.
    ConnectionLost,
    /// The runtime is at its session limit and configured to reject.
    Overloaded,
    /// The session was cancelled on request.
    CancellationRequested,
    /// An unexpected fault inside the runtime.
    InternalError,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::RegistrationError,
        ErrorKind::UnknownFunction,
        ErrorKind::InvalidArguments,
        ErrorKind::ScriptError,
        ErrorKind::FunctionError,
        ErrorKind::Timeout,
        ErrorKind::ConnectionLost,
        ErrorKind::Overloaded,
        ErrorKind::CancellationRequested,
        ErrorKind::InternalError,
    ];

    /// The wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistrationError => "RegistrationError",
            Self::UnknownFunction => "UnknownFunction",
            Self::InvalidArguments => "InvalidArguments",
            Self::ScriptError => "ScriptError",
            Self::FunctionError => "FunctionError",
            Self::Timeout => "Timeout",
            Self::ConnectionLost => "ConnectionLost",
            Self::Overloaded => "Overloaded",
            Self::CancellationRequested => "CancellationRequested",
            Self::InternalError => "InternalError",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Returns whether resubmitting the same request may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::ConnectionLost => true,
            Self::Overloaded => true,
            Self::RegistrationError => false,
            Self::UnknownFunction => false,
            Self::InvalidArguments => false,
            Self::ScriptError => false,
            Self::FunctionError => false,
            Self::CancellationRequested => false,
            Self::InternalError => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized form of an error as delivered to clients and to script code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Script stack trace, when the error originated in script code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// A "did you mean" hint, when one could be computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorPayload {
    /// Create a payload with just a kind and a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            suggestion: None,
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.filter(|s| !s.trim().is_empty());
        self
    }

    /// Attach a suggestion.
    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    /// Whether the request that produced this payload may succeed if retried.
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Failure of a single call dispatched from a script to a registered function.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallError {
    /// No function with this name is registered.
    #[error("unknown function: '{name}'")]
    UnknownFunction {
        /// The name the script asked for.
        name: String,
        /// Closest registered name, if any is close enough.
        suggestion: Option<String>,
    },

    /// Arguments did not match the declared parameter types.
    #[error("invalid arguments for '{function}': {reason}")]
    InvalidArguments {
        /// The function being called.
        function: String,
        /// What did not match.
        reason: String,
    },

    /// The function implementation raised.
    #[error("{message}")]
    FunctionFault {
        /// The function that raised.
        function: String,
        /// Redacted error message.
        message: String,
    },

    /// The script exceeded its call quota.
    #[error("call limit exceeded (max {max} calls per session)")]
    LimitExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// The call record was released before a result arrived.
    #[error("call to '{function}' was abandoned before it completed")]
    Abandoned {
        /// The function that was being called.
        function: String,
    },

    /// The owning session was cancelled while the call was pending.
    #[error("call cancelled")]
    Cancelled,

    /// An unexpected runtime fault.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CallError {
    /// The taxonomy kind for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownFunction { .. } => ErrorKind::UnknownFunction,
            Self::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            Self::FunctionFault { .. } => ErrorKind::FunctionError,
            Self::LimitExceeded { .. } => ErrorKind::ScriptError,
            Self::Abandoned { .. } => ErrorKind::CancellationRequested,
            Self::Cancelled => ErrorKind::CancellationRequested,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Returns whether the call may succeed if retried.
    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }

    /// Convert into the payload that crosses the dispatch channel.
    pub fn to_payload(&self) -> ErrorPayload {
        let suggestion = match self {
            Self::UnknownFunction { suggestion, .. } => suggestion.clone(),
            Self::LimitExceeded { .. } => Some("Batch work into fewer calls".to_string()),
            _ => None,
        };
        ErrorPayload::new(self.kind(), self.to_string()).with_suggestion(suggestion)
    }

    /// Convert to a structured JSON error for client consumption.
    ///
    /// Returns an object with `error`, `code`, `message`, `retryable`, and
    /// `suggested_fix` when one is available.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let payload = self.to_payload();
        let mut obj = serde_json::json!({
            "error": true,
            "code": payload.kind.as_str(),
            "message": payload.message,
            "retryable": self.retryable(),
        });

        if let Some(fix) = payload.suggestion {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest registered name using Levenshtein distance.
///
/// Returns a suggestion string if a name within edit distance 3 is found.
pub fn suggest<'a>(name: &str, known: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;

    for candidate in known {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }

    best.map(|(_, candidate)| format!("Did you mean '{candidate}'?"))
}

// Compile-time assertion: CallError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<CallError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
        assert_eq!(ErrorKind::from_name("NoSuchKind"), None);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Timeout.retryable());
        assert!(ErrorKind::Overloaded.retryable());
        assert!(ErrorKind::ConnectionLost.retryable());
        assert!(!ErrorKind::UnknownFunction.retryable());
        assert!(!ErrorKind::FunctionError.retryable());
        assert!(!ErrorKind::CancellationRequested.retryable());
    }

    #[test]
    fn display_unknown_function() {
        let err = CallError::UnknownFunction {
            name: "dubble".into(),
            suggestion: None,
        };
        assert_eq!(err.to_string(), "unknown function: 'dubble'");
    }

    #[test]
    fn display_invalid_arguments() {
        let err = CallError::InvalidArguments {
            function: "double".into(),
            reason: "argument 'x': expected number, got string".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid arguments for 'double': argument 'x': expected number, got string"
        );
    }

    #[test]
    fn display_internal() {
        let err = CallError::Internal(anyhow::anyhow!("something broke"));
        assert_eq!(err.to_string(), "something broke");
    }

    #[test]
    fn kind_mapping() {
        let cases: Vec<(CallError, ErrorKind)> = vec![
            (
                CallError::UnknownFunction {
                    name: "x".into(),
                    suggestion: None,
                },
                ErrorKind::UnknownFunction,
            ),
            (
                CallError::InvalidArguments {
                    function: "f".into(),
                    reason: "r".into(),
                },
                ErrorKind::InvalidArguments,
            ),
            (
                CallError::FunctionFault {
                    function: "f".into(),
                    message: "boom".into(),
                },
                ErrorKind::FunctionError,
            ),
            (CallError::LimitExceeded { max: 3 }, ErrorKind::ScriptError),
            (
                CallError::Abandoned {
                    function: "f".into(),
                },
                ErrorKind::CancellationRequested,
            ),
            (CallError::Cancelled, ErrorKind::CancellationRequested),
            (
                CallError::Internal(anyhow::anyhow!("x")),
                ErrorKind::InternalError,
            ),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.kind(), *expected, "wrong kind for {err}");
        }
    }

    #[test]
    fn payload_carries_suggestion() {
        let err = CallError::UnknownFunction {
            name: "dubble".into(),
            suggestion: suggest("dubble", ["double", "triple"]),
        };
        let payload = err.to_payload();
        assert_eq!(payload.kind, ErrorKind::UnknownFunction);
        assert_eq!(payload.suggestion.as_deref(), Some("Did you mean 'double'?"));
    }

    #[test]
    fn payload_serialization_skips_empty_fields() {
        let payload = ErrorPayload::new(ErrorKind::Timeout, "too slow");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "Timeout");
        assert!(json.get("stack").is_none());
        assert!(json.get("suggestion").is_none());
    }

    #[test]
    fn blank_stack_is_dropped() {
        let payload =
            ErrorPayload::new(ErrorKind::ScriptError, "boom").with_stack(Some("   ".into()));
        assert!(payload.stack.is_none());
    }

    #[test]
    fn structured_error_unknown_function() {
        let err = CallError::UnknownFunction {
            name: "fetch_user".into(),
            suggestion: suggest("fetch_user", ["fetchUser", "fetch_users"]),
        };
        let json = err.to_structured_error();
        assert_eq!(json["error"], true);
        assert_eq!(json["code"], "UnknownFunction");
        assert_eq!(json["retryable"], false);
        assert!(json["suggested_fix"]
            .as_str()
            .unwrap()
            .contains("fetch_users"));
    }

    #[test]
    fn structured_error_internal_no_suggestion() {
        let err = CallError::Internal(anyhow::anyhow!("unexpected"));
        let json = err.to_structured_error();
        assert_eq!(json["code"], "InternalError");
        assert!(json.get("suggested_fix").is_none());
    }

    #[test]
    fn suggest_no_match_beyond_threshold() {
        assert!(suggest("zzzzzzz", ["double", "triple"]).is_none());
    }

    #[test]
    fn suggest_prefers_closest() {
        let hint = suggest("tripel", ["double", "triple", "tripled"]).unwrap();
        assert!(hint.contains("'triple'"), "got: {hint}");
    }

    #[test]
    fn from_anyhow_error() {
        let err: CallError = anyhow::anyhow!("test anyhow").into();
        assert!(matches!(err, CallError::Internal(_)));
    }
}
