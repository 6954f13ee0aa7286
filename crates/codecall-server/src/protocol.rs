//! Wire messages exchanged between clients and the runtime.
//!
//! Every client request carries an `id` chosen by the client; every server
//! message answering it echoes that `id`. An `Execute` request is answered
//! twice: `Accepted` as soon as the session exists, then exactly one
//! `ExecuteResult` when it ends.

use codecall_error::{ErrorKind, ErrorPayload};
use codecall_registry::FunctionDescriptor;
use codecall_sandbox::{ExecutionResult, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{SessionState, SessionStatus};

/// Client-chosen request identifier.
pub type RequestId = u64;

/// Messages sent from a client to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// List the registered functions.
    Discover {
        /// Request id.
        id: RequestId,
    },
    /// Run a script in a new session.
    Execute {
        /// Request id.
        id: RequestId,
        /// The script source.
        code: String,
    },
    /// Cancel a session. Cancelling a finished session is a no-op.
    Cancel {
        /// Request id.
        id: RequestId,
        /// The session to cancel.
        session_id: SessionId,
    },
    /// Report a session's state.
    Status {
        /// Request id.
        id: RequestId,
        /// The session to report.
        session_id: SessionId,
    },
}

impl ClientMessage {
    /// The request id.
    pub fn id(&self) -> RequestId {
        match self {
            Self::Discover { id }
            | Self::Execute { id, .. }
            | Self::Cancel { id, .. }
            | Self::Status { id, .. } => *id,
        }
    }
}

/// Messages sent from the runtime to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Answer to `Discover`, in registry order.
    Functions {
        /// Request id.
        id: RequestId,
        /// The registered functions.
        functions: Vec<FunctionDescriptor>,
    },
    /// The session for an `Execute` request was created.
    Accepted {
        /// Request id.
        id: RequestId,
        /// The new session.
        session_id: SessionId,
    },
    /// The terminal result of an `Execute` request.
    ExecuteResult {
        /// Request id.
        id: RequestId,
        /// The session, absent when none could be created.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        /// `status` plus `value` or `error`.
        #[serde(flatten)]
        result: ExecutionResult,
    },
    /// Answer to `Cancel`.
    CancelAck {
        /// Request id.
        id: RequestId,
        /// The session.
        session_id: SessionId,
        /// The session's state after the request.
        state: SessionState,
    },
    /// Answer to `Status`.
    StatusReport {
        /// Request id.
        id: RequestId,
        /// The session.
        session_id: SessionId,
        /// The session's state and, once finished, its result.
        #[serde(flatten)]
        status: SessionStatus,
    },
    /// The request could not be served.
    Error {
        /// Request id, when the request was readable enough to have one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        /// What went wrong.
        error: ErrorPayload,
    },
}

impl ServerMessage {
    /// An `Error` reply carrying `kind` and `message`.
    pub fn error(id: Option<RequestId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            error: ErrorPayload::new(kind, message),
        }
    }
}

/// Errors on the framed transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame announced more bytes than the configured maximum.
    #[error("frame too large: {len} bytes (limit: {max} bytes)")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame did not hold a valid message.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolError {
    /// The taxonomy kind reported to the peer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::ConnectionLost,
            Self::FrameTooLarge { .. } | Self::Malformed(_) => ErrorKind::InvalidArguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codecall_registry::{Param, TypeTree};
    use serde_json::json;

    #[test]
    fn client_messages_are_type_tagged() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "Execute", "id": 3, "code": "return 1"}))
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Execute {
                id: 3,
                code: "return 1".into()
            }
        );
        assert_eq!(msg.id(), 3);

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "Cancel", "id": 4, "session_id": 9})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Cancel {
                id: 4,
                session_id: SessionId(9)
            }
        );
    }

    #[test]
    fn execute_result_is_flat() {
        let msg = ServerMessage::ExecuteResult {
            id: 1,
            session_id: Some(SessionId(2)),
            result: ExecutionResult::ok(json!(42)),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({"type": "ExecuteResult", "id": 1, "session_id": 2, "status": "ok", "value": 42})
        );
        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn overloaded_result_has_no_session() {
        let msg = ServerMessage::ExecuteResult {
            id: 7,
            session_id: None,
            result: ExecutionResult::error(ErrorPayload::new(ErrorKind::Overloaded, "busy")),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("session_id").is_none());
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["kind"], "Overloaded");
    }

    #[test]
    fn functions_list_carries_descriptors() {
        let msg = ServerMessage::Functions {
            id: 1,
            functions: vec![FunctionDescriptor::new(
                "double",
                vec![Param::new("x", TypeTree::number())],
                TypeTree::number(),
                "math.ts",
            )],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Functions");
        assert_eq!(json["functions"][0]["name"], "double");
    }

    #[test]
    fn protocol_error_kinds() {
        let err = ProtocolError::FrameTooLarge { len: 10, max: 5 };
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        let err = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    }
}
