#![warn(missing_docs)]

//! # codecall-sandbox
//!
//! Execution engine for codecall sessions.
//!
//! A session runs one script in a fresh deno_core isolate. Every registered
//! function the script touches is reached through the session's
//! [`DispatchClient`](channel::DispatchClient): the call is tagged with
//! `(session_id, call_id)`, forwarded to a [`FunctionHost`], and resolved
//! when the host answers with the same ids, in whatever order answers come.
//!
//! ## Security model
//!
//! - **Two contexts**: untrusted scripts and privileged functions never share
//!   an isolate
//! - **Fixed profiles**: scripts get network access only; functions get the
//!   configured function profile
//! - **Fresh runtime per session**: no state leaks between sessions
//! - **Pre-execution validation**: banned patterns caught before reaching V8
//! - **Timeout enforcement**: a watchdog terminates CPU-bound scripts
//! - **Heap limits**: near-heap-limit termination instead of an OOM abort
//! - **Redaction**: function faults are scrubbed before the script sees them

pub mod audit;
pub mod capabilities;
pub mod channel;
pub mod engine;
pub mod error;
pub mod executor;
pub mod host;
pub mod ops;
pub mod redact;
pub mod script;
pub mod validator;

use std::sync::Arc;

use codecall_registry::Registry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use channel::{CallForward, CallResult, CallTable, DispatchClient, SessionId};
pub use engine::{ExecutionResult, SandboxEngine};
pub use error::SandboxError;
pub use executor::SandboxConfig;
pub use host::{HostSession, NativeFunctionHost, ScriptFunctionHost};

/// The privileged side of the dispatch channel.
///
/// A host is opened once per session. It receives that session's
/// [`CallForward`]s through [`HostSession::forward`] and must answer each
/// with exactly one [`CallResult`] on `results`, echoing its ids. Calls must
/// be validated against `registry`, the snapshot the session started with.
#[async_trait::async_trait]
pub trait FunctionHost: Send + Sync {
    /// Open the host side of `session_id`.
    ///
    /// Cancelling `cancel` closes the session's host.
    async fn open(
        &self,
        session_id: SessionId,
        registry: Arc<Registry>,
        results: mpsc::UnboundedSender<CallResult>,
        cancel: CancellationToken,
    ) -> Result<HostSession, SandboxError>;
}
