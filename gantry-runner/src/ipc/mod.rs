// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The IPC channel between the dispatcher and each worker.
//!
//! Messages are length-prefixed (u32 little-endian) JSON frames over the
//! worker's stdin (parent to worker) and stdout (worker to parent). The
//! pipes guarantee in-order delivery and disconnect when either end exits.

mod messages;

pub use messages::*;

use crate::errors::IpcError;
use serde::{de::DeserializeOwned, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Writes one frame: length prefix, then the JSON payload.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
        len: u32::MAX,
        max: MAX_FRAME_LEN,
    })?;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF at a frame boundary;
/// an EOF mid-frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// A bidirectional frame channel over a reader/writer pair.
#[derive(Debug)]
pub struct Channel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps a reader/writer pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Sends one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        write_frame(&mut self.writer, message).await
    }

    /// Receives one message; `None` on clean disconnect.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        read_frame(&mut self.reader).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::TestId;
    use pretty_assertions::assert_eq;

    fn test_id(raw: &str) -> TestId {
        serde_json::from_str(&format!("\"{raw}\"")).unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let mut buf = Vec::new();
        let msg = WorkerMessage::Stdio {
            test_id: test_id("0123456789abcdef"),
            stream: StdioStream::Stdout,
            data: "hello\n".to_owned(),
        };
        write_frame(&mut buf, &msg).await.unwrap();
        write_frame(&mut buf, &WorkerMessage::Done {
            pending_worker: true,
        })
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: WorkerMessage = read_frame(&mut cursor).await.unwrap().unwrap();
        let second: WorkerMessage = read_frame(&mut cursor).await.unwrap().unwrap();
        let eof: Option<WorkerMessage> = read_frame(&mut cursor).await.unwrap();

        match first {
            WorkerMessage::Stdio { stream, data, .. } => {
                assert_eq!(stream, StdioStream::Stdout);
                assert_eq!(data, "hello\n");
            }
            other => panic!("expected stdio frame, got {other:?}"),
        }
        assert!(matches!(
            second,
            WorkerMessage::Done {
                pending_worker: true
            }
        ));
        assert!(eof.is_none(), "clean EOF yields None");
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &WorkerMessage::Ready {}).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, WorkerMessage>(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::errors::IpcError::Io(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, WorkerMessage>(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::errors::IpcError::FrameTooLarge { .. }));
    }
}
