//! Command dispatch seam.
//!
//! Once a session receives START, the accumulated arguments are handed to a
//! [`Dispatcher`] together with the session's stdin and output streams. What
//! a command does is up to the dispatcher; the session only relays bytes and
//! reports the returned status.

use bytes::Bytes;
use futures::future::BoxFuture;
use plaincli_protocol::{ChunkKind, FramedWriter, ProtocolError};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// A command invocation assembled from the request phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Command name (the first ARG).
    pub command: String,
    /// Remaining arguments, in the order received.
    pub args: Vec<String>,
    /// Client locale, if one was sent.
    pub locale: Option<String>,
    /// Client character encoding, if one was sent.
    pub encoding: Option<String>,
}

/// Streams available to a running command.
pub struct CommandIo {
    pub stdin: StdinSource,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
}

/// Executes named commands.
pub trait Dispatcher: Send + Sync + 'static {
    /// Runs a command to completion and returns its exit status.
    fn dispatch<'a>(
        &'a self,
        invocation: Invocation,
        io: &'a mut CommandIo,
    ) -> BoxFuture<'a, Result<i32, DispatchError>>;
}

/// Command failures reported back to the client as stderr plus a status.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No such command {0}")]
    NoSuchCommand(String),

    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Writing output to the client failed; the session is already lost.
    #[error("output failed: {0}")]
    Output(#[from] ProtocolError),
}

impl DispatchError {
    /// Exit status reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchError::NoSuchCommand(_) | DispatchError::Usage(_) => 2,
            DispatchError::Failed(_) | DispatchError::Io(_) | DispatchError::Output(_) => 1,
        }
    }

    /// Line written to the client's stderr.
    pub fn stderr_message(&self) -> String {
        match self {
            DispatchError::NoSuchCommand(_) | DispatchError::Usage(_) => self.to_string(),
            _ => format!("ERROR: {}", self),
        }
    }
}

/// Stdin of a running command, fed by STDIN frames.
///
/// Reads return EOF once END_STDIN arrives or the session ends.
pub struct StdinSource {
    chunks: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl StdinSource {
    /// Creates a source and the sender the session feeds it through.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                chunks: rx,
                pending: Bytes::new(),
            },
        )
    }

    /// A source that is already at EOF.
    pub fn empty() -> Self {
        Self::channel(1).1
    }
}

impl AsyncRead for StdinSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.pending.is_empty() {
            match ready!(this.chunks.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

/// Stdout or stderr of a running command; writes become chunk frames.
pub struct OutputStream {
    writer: Arc<FramedWriter>,
    kind: ChunkKind,
    written: u64,
}

impl OutputStream {
    pub fn stdout(writer: Arc<FramedWriter>) -> Self {
        Self {
            writer,
            kind: ChunkKind::Stdout,
            written: 0,
        }
    }

    pub fn stderr(writer: Arc<FramedWriter>) -> Self {
        Self {
            writer,
            kind: ChunkKind::Stderr,
            written: 0,
        }
    }

    /// Sends `data` to the client right away.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.writer.send_chunks(self.kind, data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Sends `line` followed by a newline.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_all(&data).await
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}
