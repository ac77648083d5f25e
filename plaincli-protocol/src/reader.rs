//! Framed reader task.
//!
//! One reader runs per direction of a connection. It pulls bytes from the
//! input stream, decodes frames one at a time, and pushes them onto a bounded
//! channel in arrival order. The consumer (the protocol handler) owns all
//! session state and processes the channel sequentially, so frame `n + 1` is
//! never handled before frame `n`.
//!
//! Exactly one [`ReaderEvent::Closed`] ends every event stream, whatever the
//! cause: end of stream, a CLOSE frame, an I/O error, or corruption. Nothing is
//! emitted after it.

use crate::codec::{format_read_back, Decoder};
use crate::error::ProtocolError;
use crate::frame::Frame;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Capacity of the channel between a reader and its handler.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Upper bound on bytes captured after a corruption.
pub const READ_BACK_LIMIT: usize = 256;

/// Read-back stops once the stream stays quiet for this long.
pub const READ_BACK_QUIET: Duration = Duration::from_millis(100);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Event delivered from a reader to its handler.
#[derive(Debug)]
pub enum ReaderEvent {
    /// A decoded frame (never CLOSE; that arrives as `Closed(Remote)`).
    Frame(Frame),
    /// The stream ended. Always the last event.
    Closed(CloseReason),
}

/// Why a reader stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// Clean end of stream on a frame boundary.
    Eof,
    /// The peer sent CLOSE.
    Remote,
    /// The peer sent bytes that do not decode.
    Corrupt(Corruption),
    /// The transport failed, including EOF in the middle of a frame.
    Io(io::Error),
}

impl CloseReason {
    /// Returns whether the session ended without a fault.
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Eof | CloseReason::Remote)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "end of stream"),
            CloseReason::Remote => write!(f, "closed by peer"),
            CloseReason::Corrupt(corruption) => write!(f, "{}", corruption),
            CloseReason::Io(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// A corruption event: the decode failure plus the raw bytes found from the
/// offending byte onwards.
#[derive(Debug, Error)]
#[error("corrupt stream: {cause}. Read back: {}", format_read_back(.read_back))]
pub struct Corruption {
    pub cause: ProtocolError,
    pub read_back: Vec<u8>,
}

/// Decodes frames from an input stream and forwards them to a handler.
pub struct FramedReader {
    stream: BoxedRead,
    decoder: Decoder,
    read_buffer_size: usize,
    label: String,
}

impl FramedReader {
    /// Creates a reader. `label` prefixes its log lines (peer address or
    /// side name).
    pub fn new(stream: impl AsyncRead + Send + Unpin + 'static, label: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            decoder: Decoder::new(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            label: label.into(),
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Spawns the reader loop and returns its event channel.
    pub fn spawn(self) -> (JoinHandle<()>, mpsc::Receiver<ReaderEvent>) {
        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        let handle = tokio::spawn(self.run(tx));
        (handle, rx)
    }

    /// Runs the reader loop until the stream ends or the handler goes away.
    pub async fn run(mut self, events: mpsc::Sender<ReaderEvent>) {
        let Some(reason) = self.read_frames(&events).await else {
            tracing::debug!("[{}] Handler gone, reader stopping", self.label);
            return;
        };

        match &reason {
            CloseReason::Corrupt(corruption) => {
                tracing::warn!("[{}] {}", self.label, corruption);
            }
            CloseReason::Io(e) => {
                tracing::debug!("[{}] Read failed: {}", self.label, e);
            }
            CloseReason::Eof | CloseReason::Remote => {
                tracing::debug!("[{}] Stream closed: {}", self.label, reason);
            }
        }

        let _ = events.send(ReaderEvent::Closed(reason)).await;
    }

    /// Returns `None` if the event receiver was dropped.
    async fn read_frames(&mut self, events: &mpsc::Sender<ReaderEvent>) -> Option<CloseReason> {
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            loop {
                match self.decoder.decode_frame() {
                    Ok(Some(Frame::Close)) => return Some(CloseReason::Remote),
                    Ok(Some(frame)) => {
                        tracing::trace!("[{}] Received {} frame", self.label, frame.kind());
                        if events.send(ReaderEvent::Frame(frame)).await.is_err() {
                            return None;
                        }
                    }
                    Ok(None) => break,
                    Err(cause) => {
                        let corruption = self.read_back(cause, &mut buf).await;
                        return Some(CloseReason::Corrupt(corruption));
                    }
                }
            }

            match self.stream.read(&mut buf).await {
                Ok(0) => {
                    let pending = self.decoder.buffered();
                    if pending == 0 {
                        return Some(CloseReason::Eof);
                    }
                    return Some(CloseReason::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended inside a frame ({} bytes buffered)", pending),
                    )));
                }
                Ok(n) => self.decoder.extend(&buf[..n]),
                Err(e) => return Some(CloseReason::Io(e)),
            }
        }
    }

    /// Collects the bytes from the offending one onwards for diagnosis.
    ///
    /// No attempt is made to find the next frame boundary; the session ends.
    async fn read_back(&mut self, cause: ProtocolError, buf: &mut [u8]) -> Corruption {
        let mut read_back = self.decoder.take_buffered().to_vec();
        while read_back.len() < READ_BACK_LIMIT {
            match tokio::time::timeout(READ_BACK_QUIET, self.stream.read(buf)).await {
                Ok(Ok(n)) if n > 0 => read_back.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        read_back.truncate(READ_BACK_LIMIT);
        Corruption { cause, read_back }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    async fn collect(mut rx: mpsc::Receiver<ReaderEvent>) -> (Vec<Frame>, Vec<CloseReason>) {
        let mut frames = Vec::new();
        let mut closes = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ReaderEvent::Frame(frame) => {
                    assert!(closes.is_empty(), "frame after close: {:?}", frame);
                    frames.push(frame);
                }
                ReaderEvent::Closed(reason) => closes.push(reason),
            }
        }
        (frames, closes)
    }

    fn encode(frames: &[Frame]) -> Vec<u8> {
        Encoder::encode_all(frames).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_corruption_is_reported_and_closes_once() {
        let stream = Builder::new().read(&[0xff, 0xff, 0xff, 0xff]).build();
        let (handle, rx) = FramedReader::new(stream, "test").spawn();

        let (frames, closes) = collect(rx).await;
        handle.await.unwrap();

        assert!(frames.is_empty());
        assert_eq!(closes.len(), 1);
        let CloseReason::Corrupt(corruption) = &closes[0] else {
            panic!("expected corruption, got {:?}", closes[0]);
        };
        assert!(matches!(corruption.cause, ProtocolError::UnknownKind(0xff)));
        assert!(corruption
            .to_string()
            .contains("Read back: 0xff 0xff 0xff 0xff"));
    }

    #[tokio::test]
    async fn test_read_back_includes_later_bytes() {
        let mut wire = encode(&[Frame::Arg("ok".to_string())]);
        wire.push(0x42);
        let stream = Builder::new()
            .read(&wire)
            .read(&[0x01, 0x02])
            .build();
        let (_handle, rx) = FramedReader::new(stream, "test").spawn();

        let (frames, closes) = collect(rx).await;
        assert_eq!(frames, vec![Frame::Arg("ok".to_string())]);
        let CloseReason::Corrupt(corruption) = &closes[0] else {
            panic!("expected corruption");
        };
        assert_eq!(corruption.read_back, vec![0x42, 0x01, 0x02]);
        assert!(corruption.to_string().ends_with("Read back: 0x42 0x01 0x02"));
    }

    #[tokio::test]
    async fn test_frames_dispatched_in_order_across_reads() {
        let frames = vec![
            Frame::Arg("copy".to_string()),
            Frame::Arg("a".to_string()),
            Frame::Arg("b".to_string()),
            Frame::Start,
            Frame::Stdin(Bytes::from_static(b"payload")),
            Frame::EndStdin,
        ];
        let wire = encode(&frames);
        let mut builder = Builder::new();
        // Odd-sized reads split frames at arbitrary points.
        for piece in wire.chunks(3) {
            builder.read(piece);
        }
        let (_handle, rx) = FramedReader::new(builder.build(), "test").spawn();

        let (received, closes) = collect(rx).await;
        assert_eq!(received, frames);
        assert_eq!(closes.len(), 1);
        assert!(matches!(closes[0], CloseReason::Eof));
    }

    #[tokio::test]
    async fn test_close_frame_stops_dispatch() {
        let wire = encode(&[
            Frame::Exit(0),
            Frame::Close,
            Frame::Stdout(Bytes::from_static(b"late")),
        ]);
        let (_handle, rx) = FramedReader::new(Builder::new().read(&wire).build(), "test").spawn();

        let (frames, closes) = collect(rx).await;
        assert_eq!(frames, vec![Frame::Exit(0)]);
        assert_eq!(closes.len(), 1);
        assert!(matches!(closes[0], CloseReason::Remote));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let wire = encode(&[Frame::Stdout(Bytes::from_static(b"abcdef"))]);
        let stream = Builder::new().read(&wire[..4]).build();
        let (_handle, rx) = FramedReader::new(stream, "test").spawn();

        let (frames, closes) = collect(rx).await;
        assert!(frames.is_empty());
        let CloseReason::Io(e) = &closes[0] else {
            panic!("expected I/O close");
        };
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_error_closes_once() {
        let wire = encode(&[Frame::Start]);
        let stream = Builder::new()
            .read(&wire)
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (_handle, rx) = FramedReader::new(stream, "test").spawn();

        let (frames, closes) = collect(rx).await;
        assert_eq!(frames, vec![Frame::Start]);
        assert_eq!(closes.len(), 1);
        assert!(!closes[0].is_clean());
        assert!(closes[0].to_string().contains("reset"));
    }

    #[tokio::test]
    async fn test_read_back_stops_when_stream_goes_quiet() {
        let (mut tx, rx_stream) = tokio::io::duplex(64);
        let (_handle, rx) = FramedReader::new(rx_stream, "test")
            .with_read_buffer_size(16)
            .spawn();

        tx.write_all(&[0x0c, 0x0d]).await.unwrap();
        // Keep the writer open: only the quiet period can end the read-back.
        let (frames, closes) = collect(rx).await;
        drop(tx);

        assert!(frames.is_empty());
        let CloseReason::Corrupt(corruption) = &closes[0] else {
            panic!("expected corruption");
        };
        assert_eq!(corruption.read_back, vec![0x0c, 0x0d]);
    }

    #[tokio::test]
    async fn test_reader_stops_when_handler_drops() {
        let wire = encode(&[Frame::Start, Frame::EndStdin]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Must return instead of blocking on a dead channel.
        FramedReader::new(Builder::new().read(&wire).build(), "test")
            .run(tx)
            .await;
    }
}
