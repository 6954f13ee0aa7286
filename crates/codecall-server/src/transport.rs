//! Length-delimited JSON framing.
//!
//! Each frame is a 4-byte big-endian length prefix followed by that many
//! bytes of JSON. The reader rejects frames above a configured limit before
//! allocating for them.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::ProtocolError;

/// Default maximum frame size: 8 MB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Write one message as a frame and flush.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame's payload.
///
/// Returns `None` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(ProtocolError::FrameTooLarge { len, max: max_size });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Read and decode one message.
///
/// Returns `None` on a clean EOF at a frame boundary.
pub async fn read_message<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, ProtocolError> {
    match read_frame(reader, max_size).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ServerMessage};
    use codecall_sandbox::{ExecutionResult, SessionId};
    use std::io::Cursor;

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let mut buf = Vec::new();
        write_message(&mut buf, &ClientMessage::Discover { id: 1 })
            .await
            .unwrap();
        write_message(
            &mut buf,
            &ClientMessage::Execute {
                id: 2,
                code: "return await double(21)".into(),
            },
        )
        .await
        .unwrap();

        let mut cursor = Cursor::new(buf);
        let first: ClientMessage = read_message(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, ClientMessage::Discover { id: 1 });
        let second: ClientMessage = read_message(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id(), 2);
        let eof: Option<ClientMessage> = read_message(&mut cursor, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn length_prefix_is_big_endian() {
        let mut buf = Vec::new();
        let msg = ServerMessage::ExecuteResult {
            id: 1,
            session_id: Some(SessionId(1)),
            result: ExecutionResult::ok(serde_json::json!(42)),
        };
        write_message(&mut buf, &msg).await.unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_reading() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(1024u32).to_be_bytes());
        buf.extend_from_slice(&[b'x'; 16]);
        let err = read_frame(&mut Cursor::new(buf), 512).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge {
                len: 1024,
                max: 512
            }
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_io_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(64u32).to_be_bytes());
        buf.extend_from_slice(b"{\"type\":");
        let err = read_frame(&mut Cursor::new(buf), 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)), "{err:?}");
    }

    #[tokio::test]
    async fn malformed_json_is_reported() {
        let mut buf = Vec::new();
        let payload = b"not json";
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        let err = read_message::<ClientMessage, _>(&mut Cursor::new(buf), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
