//! Framed writer shared by every task that sends on one connection.
//!
//! The underlying stream sits behind an async mutex that is held for exactly
//! one frame: the frame is encoded first, then written and flushed in full
//! while the lock is held. Concurrent senders (a stdout relay and a stderr
//! relay, or the stdin relay and a keepalive) therefore never interleave
//! partial frames on the wire.
//!
//! CLOSE is the last frame a writer puts on the wire. Sends that reach the
//! lock after it fail with [`ProtocolError::AlreadyClosed`].

use crate::error::ProtocolError;
use crate::frame::{ChunkKind, Frame};
use crate::MAX_PAYLOAD_SIZE;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

struct Output {
    stream: BoxedWrite,
    closed: bool,
}

/// Serializes frames onto an output byte stream.
pub struct FramedWriter {
    inner: Mutex<Output>,
}

impl FramedWriter {
    pub fn new(stream: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Mutex::new(Output {
                stream: Box::new(stream),
                closed: false,
            }),
        }
    }

    /// Encodes, writes, and flushes one frame.
    ///
    /// A failure here means the transport is unusable; callers treat it as
    /// the end of the session.
    pub async fn send(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let encoded = frame.encode()?;
        let mut output = self.inner.lock().await;
        if output.closed {
            return Err(ProtocolError::AlreadyClosed(frame.kind()));
        }
        output.stream.write_all(&encoded).await?;
        output.stream.flush().await?;
        if matches!(frame, Frame::Close) {
            output.closed = true;
        }
        tracing::trace!("sent {} frame ({} bytes)", frame.kind(), encoded.len());
        Ok(())
    }

    pub async fn send_arg(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Frame::Arg(text.into())).await
    }

    pub async fn send_locale(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Frame::Locale(text.into())).await
    }

    pub async fn send_encoding(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Frame::Encoding(text.into())).await
    }

    pub async fn send_start(&self) -> Result<(), ProtocolError> {
        self.send(&Frame::Start).await
    }

    pub async fn send_end_stdin(&self) -> Result<(), ProtocolError> {
        self.send(&Frame::EndStdin).await
    }

    pub async fn send_exit(&self, code: i32) -> Result<(), ProtocolError> {
        self.send(&Frame::Exit(code)).await
    }

    pub async fn send_close(&self) -> Result<(), ProtocolError> {
        self.send(&Frame::Close).await
    }

    /// Sends `data` as one or more chunk frames of the given kind.
    ///
    /// Data longer than one frame is split at the payload limit; the lock is
    /// taken per frame so other senders may interleave whole frames between
    /// the pieces. Empty data sends nothing.
    pub async fn send_chunks(&self, kind: ChunkKind, data: &[u8]) -> Result<(), ProtocolError> {
        for piece in data.chunks(MAX_PAYLOAD_SIZE) {
            self.send(&kind.frame(Bytes::copy_from_slice(piece))).await?;
        }
        Ok(())
    }

    /// Shuts down the write direction of the transport.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.inner.lock().await.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::frame::FrameKind;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    async fn drain(mut rx: tokio::io::DuplexStream) -> Vec<Frame> {
        let mut bytes = Vec::new();
        rx.read_to_end(&mut bytes).await.unwrap();
        let mut decoder = Decoder::new();
        decoder.extend(&bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(decoder.buffered(), 0);
        frames
    }

    #[tokio::test]
    async fn test_typed_sends() {
        let (tx, rx) = tokio::io::duplex(1024);
        let writer = FramedWriter::new(tx);
        writer.send_arg("echo").await.unwrap();
        writer.send_locale("en_US").await.unwrap();
        writer.send_encoding("UTF-8").await.unwrap();
        writer.send_start().await.unwrap();
        writer.send_end_stdin().await.unwrap();
        writer.send_exit(3).await.unwrap();
        writer.send_close().await.unwrap();
        drop(writer);

        assert_eq!(
            drain(rx).await,
            vec![
                Frame::Arg("echo".to_string()),
                Frame::Locale("en_US".to_string()),
                Frame::Encoding("UTF-8".to_string()),
                Frame::Start,
                Frame::EndStdin,
                Frame::Exit(3),
                Frame::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_send_chunks_splits_large_data() {
        let (tx, rx) = tokio::io::duplex(4096);
        let data = vec![7u8; MAX_PAYLOAD_SIZE * 2 + 10];
        let reader = tokio::spawn(drain(rx));

        let writer = FramedWriter::new(tx);
        writer.send_chunks(ChunkKind::Stdout, &data).await.unwrap();
        writer.send_chunks(ChunkKind::Stdout, &[]).await.unwrap();
        drop(writer);

        let frames = reader.await.unwrap();
        let lens: Vec<usize> = frames
            .iter()
            .map(|f| match f {
                Frame::Stdout(chunk) => chunk.len(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(lens, vec![MAX_PAYLOAD_SIZE, MAX_PAYLOAD_SIZE, 10]);
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        // A tiny pipe forces every write_all to suspend mid-frame.
        let (tx, rx) = tokio::io::duplex(7);
        let reader = tokio::spawn(drain(rx));
        let writer = Arc::new(FramedWriter::new(tx));

        let out = Bytes::from(vec![b'o'; 5000]);
        let err = Bytes::from(vec![b'e'; 5000]);
        let mut tasks = Vec::new();
        for (frame, count) in [(Frame::Stdout(out), 20), (Frame::Stderr(err), 20)] {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..count {
                    writer.send(&frame).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        drop(writer);

        let frames = reader.await.unwrap();
        assert_eq!(frames.len(), 40);
        for frame in frames {
            match frame {
                Frame::Stdout(chunk) => assert!(chunk.iter().all(|&b| b == b'o')),
                Frame::Stderr(chunk) => assert!(chunk.iter().all(|&b| b == b'e')),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_nothing_follows_close() {
        let (tx, rx) = tokio::io::duplex(1024);
        let writer = FramedWriter::new(tx);
        writer.send_exit(0).await.unwrap();
        writer.send_close().await.unwrap();

        let late = writer
            .send_chunks(ChunkKind::Stdin, b"late")
            .await
            .unwrap_err();
        assert!(matches!(late, ProtocolError::AlreadyClosed(FrameKind::Stdin)));
        assert!(writer.send_close().await.is_err());
        writer.shutdown().await.unwrap();
        drop(writer);

        assert_eq!(drain(rx).await, vec![Frame::Exit(0), Frame::Close]);
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(rx);
        let writer = FramedWriter::new(tx);
        let result = writer.send_arg("anything").await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }
}
