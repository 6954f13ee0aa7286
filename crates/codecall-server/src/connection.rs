//! One client connection: read requests, write replies, and turn a dropped
//! transport into `ConnectionLost` for every session it still owns.

use std::sync::Arc;

use codecall_error::ErrorKind;
use codecall_sandbox::{ExecutionResult, SessionId};
use dashmap::DashSet;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientMessage, ProtocolError, RequestId, ServerMessage};
use crate::transport::{read_frame, write_message};
use crate::CodecallService;

type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Serve one connection until the peer goes away.
pub(crate) async fn serve<S>(service: Arc<CodecallService>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbox, rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let writer_task = tokio::spawn(write_loop(writer, rx, closed.clone()));
    let owned: Arc<DashSet<SessionId>> = Arc::new(DashSet::new());

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = read_frame(&mut reader, service.max_frame_size) => frame,
        };
        match frame {
            Ok(Some(payload)) => match serde_json::from_slice::<ClientMessage>(&payload) {
                Ok(msg) => handle(&service, msg, &outbox, &owned),
                Err(e) => {
                    let reply = ServerMessage::error(
                        request_id_hint(&payload),
                        ErrorKind::InvalidArguments,
                        format!("malformed message: {e}"),
                    );
                    let _ = outbox.send(reply);
                }
            },
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                tracing::warn!(error = %e, "closing connection");
                let _ = outbox.send(ServerMessage::error(None, e.kind(), e.to_string()));
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        }
    }

    let orphaned: Vec<SessionId> = owned.iter().map(|id| *id).collect();
    for id in orphaned {
        if let Ok(state) = service.coordinator().connection_lost(id) {
            tracing::debug!(session_id = %id, state = ?state, "connection closed under session");
        }
    }
    closed.cancel();
    let _ = writer_task.await;
    tracing::debug!("connection closed");
}

async fn write_loop<W: AsyncWrite + Send + 'static>(
    mut writer: WriteHalf<W>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    closed: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = closed.cancelled() => {
                // Flush what was queued before the close.
                while let Ok(msg) = rx.try_recv() {
                    if write_message(&mut writer, &msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if let Err(e) = write_message(&mut writer, &msg).await {
            tracing::debug!(error = %e, "connection write failed");
            closed.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn handle(
    service: &Arc<CodecallService>,
    msg: ClientMessage,
    outbox: &Outbox,
    owned: &Arc<DashSet<SessionId>>,
) {
    let coordinator = service.coordinator();
    let reply = match msg {
        ClientMessage::Discover { id } => ServerMessage::Functions {
            id,
            functions: service.discover(),
        },
        ClientMessage::Execute { id, code } => match coordinator.create(code) {
            Ok(handle) => {
                let session_id = handle.id();
                owned.insert(session_id);
                let _ = outbox.send(ServerMessage::Accepted { id, session_id });
                let outbox = outbox.clone();
                let owned = owned.clone();
                tokio::spawn(async move {
                    let result = handle.result().await;
                    owned.remove(&session_id);
                    let _ = outbox.send(ServerMessage::ExecuteResult {
                        id,
                        session_id: Some(session_id),
                        result,
                    });
                });
                return;
            }
            Err(e) => ServerMessage::ExecuteResult {
                id,
                session_id: None,
                result: ExecutionResult::error(e.to_payload()),
            },
        },
        ClientMessage::Cancel { id, session_id } => match coordinator.cancel(session_id) {
            Ok(state) => ServerMessage::CancelAck {
                id,
                session_id,
                state,
            },
            Err(e) => ServerMessage::Error {
                id: Some(id),
                error: e.to_payload(),
            },
        },
        ClientMessage::Status { id, session_id } => match coordinator.status(session_id) {
            Ok(status) => ServerMessage::StatusReport {
                id,
                session_id,
                status,
            },
            Err(e) => ServerMessage::Error {
                id: Some(id),
                error: e.to_payload(),
            },
        },
    };
    let _ = outbox.send(reply);
}

/// Best-effort request id from a frame that did not decode.
fn request_id_hint(payload: &[u8]) -> Option<RequestId> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("id")?
        .as_u64()
}
