#![warn(missing_docs)]

//! # codecall-server
//!
//! The codecall runtime's external surface.
//!
//! Exposes exactly two operations to clients:
//! - `discover` lists the registered functions with their types
//! - `execute` runs a script as a new session and returns one terminal
//!   result
//!
//! plus `cancel` and `status` on sessions. Clients talk to it over a
//! persistent TCP connection carrying length-prefixed JSON frames (see
//! [`transport`] and [`protocol`]). Dropping the connection ends every
//! session it started with `ConnectionLost`; nothing is resumable.

mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod transport;

use std::sync::Arc;

use codecall_registry::FunctionDescriptor;
use codecall_sandbox::{ExecutionResult, SandboxEngine};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use session::{
    CoordinatorConfig, OverflowPolicy, SessionCoordinator, SessionError, SessionHandle,
    SessionState, SessionStatus,
};
pub use transport::DEFAULT_MAX_FRAME_SIZE;

/// The codecall service: a session coordinator behind the wire protocol.
pub struct CodecallService {
    coordinator: Arc<SessionCoordinator>,
    max_frame_size: usize,
}

impl CodecallService {
    /// Create a service running sessions on `engine`.
    pub fn new(engine: SandboxEngine, config: CoordinatorConfig) -> Self {
        Self {
            coordinator: Arc::new(SessionCoordinator::new(Arc::new(engine), config)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the largest accepted request frame.
    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// The session coordinator.
    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    /// The registered functions, from the current registry.
    pub fn discover(&self) -> Vec<FunctionDescriptor> {
        self.coordinator
            .engine()
            .registry()
            .current()
            .descriptors()
            .cloned()
            .collect()
    }

    /// Run `code` as a new session and wait for its result.
    ///
    /// Admission failures are reported as an error result.
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        match self.coordinator.create(code.to_string()) {
            Ok(handle) => handle.result().await,
            Err(e) => ExecutionResult::error(e.to_payload()),
        }
    }

    /// Serve one already-accepted connection until the peer goes away.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        connection::serve(self, stream).await;
    }

    /// Accept connections on `listener` until `shutdown` is cancelled, then
    /// cancel every live session.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "codecall listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "failed to set TCP_NODELAY");
            }
            tracing::debug!(peer = %peer, "connection accepted");
            tokio::spawn(self.clone().handle_connection(stream));
        }

        let cancelled = self.coordinator.cancel_all();
        tracing::info!(cancelled, "codecall shutting down");
        Ok(())
    }
}
