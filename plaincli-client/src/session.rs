//! Client side of a session.
//!
//! [`ClientSide::start`] sends the request phase. [`ClientSide::run`] then
//! relays local stdin to the server in a background task, writes STDOUT and
//! STDERR chunks to the local sinks, and records the EXIT status. After EXIT
//! it acknowledges with CLOSE and drains until the server closes.

use crate::error::ClientError;
use crate::request::{Request, DEFAULT_ENCODING};
use bytes::Bytes;
use plaincli_protocol::{
    CloseReason, Frame, FramedWriter, ProtocolError, ReaderEvent, STDIN_CHUNK_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Result of a finished session.
#[derive(Debug)]
pub struct Outcome {
    /// Status from the EXIT frame; `None` if the session ended without one.
    pub exit_code: Option<i32>,
    /// Why the server stream ended.
    pub close: CloseReason,
}

/// Drives one session from the client end.
pub struct ClientSide {
    writer: Arc<FramedWriter>,
    label: String,
    ping_interval: Option<Duration>,
    encoding: String,
    exit_code: Option<i32>,
}

impl ClientSide {
    pub fn new(writer: Arc<FramedWriter>, label: impl Into<String>) -> Self {
        Self {
            writer,
            label: label.into(),
            ping_interval: None,
            encoding: DEFAULT_ENCODING.to_string(),
            exit_code: None,
        }
    }

    /// Resends ENCODING at this interval while the command runs.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval.filter(|i| !i.is_zero());
        self
    }

    /// Sends ARGs, LOCALE, ENCODING and START.
    pub async fn start(&mut self, request: &Request) -> Result<(), ClientError> {
        if let Some(encoding) = &request.encoding {
            self.encoding = encoding.clone();
        }
        for frame in request.frames() {
            self.writer.send(&frame).await?;
        }
        tracing::debug!(
            "[{}] Request sent ({} args)",
            self.label,
            request.args.len()
        );
        Ok(())
    }

    /// Runs the session until the server stream ends.
    ///
    /// A frame only a client may send, or a second EXIT, is a protocol
    /// violation: CLOSE is sent and the violation returned as an error.
    pub async fn run<I, O, E>(
        mut self,
        mut events: mpsc::Receiver<ReaderEvent>,
        stdin: I,
        mut stdout: O,
        mut stderr: E,
    ) -> Result<Outcome, ClientError>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let (stop_tx, stop_rx) = watch::channel(());
        let mut stop = Some(stop_tx);
        let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(relay_stdin(
            self.writer.clone(),
            stdin,
            self.label.clone(),
            stop_rx.clone(),
        ))];
        if let Some(interval) = self.ping_interval {
            tasks.push(tokio::spawn(keepalive(
                self.writer.clone(),
                interval,
                self.encoding.clone(),
                stop_rx,
            )));
        }

        let result = loop {
            let event = match events.recv().await {
                Some(event) => event,
                None => break Ok(CloseReason::Eof),
            };
            let frame = match event {
                ReaderEvent::Frame(frame) => frame,
                ReaderEvent::Closed(reason) => break Ok(reason),
            };

            match frame {
                Frame::Stdout(chunk) => {
                    if let Err(e) = write_chunk(&mut stdout, &chunk).await {
                        break Err(ClientError::Io(e));
                    }
                }
                Frame::Stderr(chunk) => {
                    if let Err(e) = write_chunk(&mut stderr, &chunk).await {
                        break Err(ClientError::Io(e));
                    }
                }
                Frame::Exit(code) if self.exit_code.is_none() => {
                    tracing::debug!("[{}] Exit: {}", self.label, code);
                    self.exit_code = Some(code);
                    // Stops the relay and keepalive at the next frame boundary.
                    stop = None;
                    if let Err(e) = self.writer.send_close().await {
                        tracing::debug!("[{}] Failed to send CLOSE: {}", self.label, e);
                    }
                }
                other => {
                    let kind = other.kind();
                    let phase = if !kind.is_server_to_client() {
                        "receiving from a server"
                    } else if self.exit_code.is_some() {
                        "exited"
                    } else {
                        "running"
                    };
                    let e = ProtocolError::UnexpectedFrame { kind, phase };
                    tracing::warn!("[{}] Protocol violation: {}", self.label, e);
                    let _ = self.writer.send_close().await;
                    break Err(ClientError::Protocol(e));
                }
            }
        };

        drop(stop);
        for task in tasks {
            task.abort();
        }
        let _ = stdout.flush().await;
        let _ = stderr.flush().await;

        // The reader has already reported any corruption.
        let close = result?;
        tracing::debug!(
            "[{}] Session ended: {} (exit={:?})",
            self.label,
            close,
            self.exit_code
        );
        Ok(Outcome {
            exit_code: self.exit_code,
            close,
        })
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(sink: &mut W, chunk: &Bytes) -> std::io::Result<()> {
    sink.write_all(chunk).await?;
    sink.flush().await
}

/// Copies local stdin into STDIN frames, then sends END_STDIN.
async fn relay_stdin<I>(
    writer: Arc<FramedWriter>,
    mut stdin: I,
    label: String,
    mut stop: watch::Receiver<()>,
) where
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; STDIN_CHUNK_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            _ = stop.changed() => return,
            read = stdin.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("[{}] Failed to read stdin: {}", label, e);
                    0
                }
            },
        };
        // EXIT may have arrived while the read was pending.
        if stop.has_changed().is_err() {
            return;
        }
        if n == 0 {
            break;
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if let Err(e) = writer.send(&Frame::Stdin(chunk)).await {
            tracing::debug!("[{}] Stdin relay stopped: {}", label, e);
            return;
        }
    }
    if let Err(e) = writer.send_end_stdin().await {
        tracing::debug!("[{}] Failed to send END_STDIN: {}", label, e);
    }
}

/// Resends ENCODING periodically so idle transports stay open.
async fn keepalive(
    writer: Arc<FramedWriter>,
    interval: Duration,
    encoding: String,
    mut stop: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                if writer.send_encoding(encoding.clone()).await.is_err() {
                    return;
                }
            }
        }
    }
}
