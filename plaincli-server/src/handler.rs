//! Server side of a session.
//!
//! [`ServerSide::run`] is the single owner of a session's state. It consumes
//! reader events one at a time and, in the same loop, watches the command
//! task started on START. The command task never touches session state; it
//! only sends STDOUT/STDERR frames through the shared [`FramedWriter`].
//!
//! STDIN chunks the command has not taken yet wait in a queue owned by the
//! loop and are handed over from a select branch, so a command that stops
//! reading stdin never keeps the loop from seeing CLOSE, end of stream or
//! shutdown.

use crate::dispatch::{CommandIo, DispatchError, Dispatcher, Invocation, OutputStream, StdinSource};
use crate::session::Session;
use bytes::Bytes;
use plaincli_protocol::reader::DEFAULT_READ_BUFFER_SIZE;
use plaincli_protocol::{
    ChunkKind, CloseReason, Frame, FramedReader, FramedWriter, ProtocolError, ReaderEvent,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Close sessions that have not sent START within this time.
    pub start_timeout: Option<Duration>,
    /// Read buffer size of the framed reader.
    pub read_buffer_size: usize,
    /// STDIN chunks handed to the command ahead of its reads.
    pub stdin_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            start_timeout: Some(Duration::from_secs(15)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            stdin_capacity: 16,
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The command ran and EXIT was sent.
    Completed,
    /// The client went away (CLOSE, end of stream, transport or corruption fault).
    Disconnected(CloseReason),
    /// The client sent a frame that is not allowed in the current phase.
    Violation(ProtocolError),
    /// Writing to the client failed.
    WriteFailed(ProtocolError),
    /// START did not arrive in time.
    StartTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl SessionEnd {
    /// Returns whether the session ended abnormally.
    pub fn is_failure(&self) -> bool {
        match self {
            SessionEnd::Completed | SessionEnd::Shutdown => false,
            SessionEnd::Disconnected(reason) => !reason.is_clean(),
            SessionEnd::Violation(_) | SessionEnd::WriteFailed(_) | SessionEnd::StartTimeout => {
                true
            }
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Completed => write!(f, "completed"),
            // The reader already logged the read-back.
            SessionEnd::Disconnected(CloseReason::Corrupt(_)) => {
                write!(f, "disconnected (corrupt stream)")
            }
            SessionEnd::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            SessionEnd::Violation(e) => write!(f, "protocol violation ({})", e),
            SessionEnd::WriteFailed(e) => write!(f, "write failed ({})", e),
            SessionEnd::StartTimeout => write!(f, "timed out waiting for start"),
            SessionEnd::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Result of a finished session.
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: String,
    /// Status sent in the EXIT frame, if one was sent.
    pub exit_code: Option<i32>,
    pub end: SessionEnd,
}

type CommandTask = JoinHandle<Result<i32, ProtocolError>>;

/// Drives one session from request to exit.
pub struct ServerSide {
    session: Session,
    writer: Arc<FramedWriter>,
    dispatcher: Arc<dyn Dispatcher>,
    options: SessionOptions,
    stdin: Option<mpsc::Sender<Bytes>>,
    /// Chunks waiting for room in the command's stdin channel.
    pending_stdin: VecDeque<Bytes>,
    stdin_ended: bool,
    command: Option<CommandTask>,
    exit_code: Option<i32>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl ServerSide {
    pub fn new(
        peer: impl Into<String>,
        writer: Arc<FramedWriter>,
        dispatcher: Arc<dyn Dispatcher>,
        options: SessionOptions,
    ) -> Self {
        Self {
            session: Session::new(peer),
            writer,
            dispatcher,
            options,
            stdin: None,
            pending_stdin: VecDeque::new(),
            stdin_ended: false,
            command: None,
            exit_code: None,
            shutdown: None,
        }
    }

    /// Ends the session when the server shuts down.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Processes reader events until the session ends.
    pub async fn run(mut self, mut events: mpsc::Receiver<ReaderEvent>) -> SessionSummary {
        let peer = self.session.peer.clone();
        let start_deadline = self.options.start_timeout.map(|t| Instant::now() + t);
        tracing::debug!("[{}] Session {} opened", peer, self.session.id);

        let end = loop {
            let awaiting_start = self.session.state().is_request_phase();
            tokio::select! {
                joined = wait_command(&mut self.command), if self.command.is_some() => {
                    self.command = None;
                    break self.on_command_done(joined).await;
                }

                permit = reserve_stdin(self.stdin.clone()), if !self.pending_stdin.is_empty() => {
                    let delivered = match permit {
                        Some(permit) => {
                            if let Some(chunk) = self.pending_stdin.pop_front() {
                                permit.send(chunk);
                            }
                            true
                        }
                        None => false,
                    };
                    if !delivered {
                        self.discard_stdin();
                    }
                    self.finish_stdin_if_drained();
                }

                event = events.recv() => match event {
                    Some(ReaderEvent::Frame(frame)) => {
                        self.session.record_frame();
                        if let Err(e) = self.on_frame(frame) {
                            tracing::warn!("[{}] Protocol violation: {}", peer, e);
                            self.send_close_quietly().await;
                            break SessionEnd::Violation(e);
                        }
                    }
                    Some(ReaderEvent::Closed(reason)) => {
                        if matches!(reason, CloseReason::Corrupt(_)) {
                            self.send_close_quietly().await;
                        }
                        break SessionEnd::Disconnected(reason);
                    }
                    None => break SessionEnd::Disconnected(CloseReason::Eof),
                },

                _ = sleep_until_deadline(start_deadline), if awaiting_start => {
                    tracing::debug!("[{}] Timeout waiting for client to start", peer);
                    break SessionEnd::StartTimeout;
                }

                _ = wait_shutdown(&mut self.shutdown), if self.shutdown.is_some() => {
                    tracing::debug!("[{}] Shutdown signal received", peer);
                    self.send_close_quietly().await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        self.handle_close();
        tracing::info!(
            "[{}] Session {} ended: {} (exit={:?}, frames={})",
            peer,
            self.session.id,
            end,
            self.exit_code,
            self.session.frames_received()
        );

        SessionSummary {
            session_id: self.session.id.clone(),
            exit_code: self.exit_code,
            end,
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match frame {
            Frame::Arg(text) => self.session.on_arg(text),
            Frame::Locale(text) => {
                if !self.session.on_locale(text) {
                    tracing::trace!("[{}] Keepalive (LOCALE)", self.session.peer);
                }
                Ok(())
            }
            Frame::Encoding(text) => {
                if !self.session.on_encoding(text) {
                    tracing::trace!("[{}] Keepalive (ENCODING)", self.session.peer);
                }
                Ok(())
            }
            Frame::Start => self.on_start(),
            Frame::Stdin(chunk) => self.on_stdin(chunk),
            Frame::EndStdin => {
                self.session.on_end_stdin()?;
                self.stdin_ended = true;
                self.finish_stdin_if_drained();
                Ok(())
            }
            other => Err(self.session.reject(other.kind())),
        }
    }

    fn on_start(&mut self) -> Result<(), ProtocolError> {
        self.session.on_start()?;

        let invocation = self.session.invocation();
        match &invocation {
            Some(inv) => tracing::info!(
                "[{}] Command: {} ({} args, locale={:?}, encoding={:?})",
                self.session.peer,
                inv.command,
                inv.args.len(),
                inv.locale,
                inv.encoding
            ),
            None => tracing::info!("[{}] START without a command", self.session.peer),
        }

        let (stdin_tx, stdin) = StdinSource::channel(self.options.stdin_capacity);
        let io = CommandIo {
            stdin,
            stdout: OutputStream::stdout(self.writer.clone()),
            stderr: OutputStream::stderr(self.writer.clone()),
        };
        self.stdin = Some(stdin_tx);
        self.command = Some(tokio::spawn(run_command(
            self.dispatcher.clone(),
            invocation,
            io,
        )));
        Ok(())
    }

    fn on_stdin(&mut self, chunk: Bytes) -> Result<(), ProtocolError> {
        self.session.on_stdin()?;
        let Some(stdin) = &self.stdin else {
            return Ok(());
        };
        if !self.pending_stdin.is_empty() {
            self.pending_stdin.push_back(chunk);
            return Ok(());
        }
        match stdin.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(chunk)) => self.pending_stdin.push_back(chunk),
            Err(TrySendError::Closed(_)) => self.discard_stdin(),
        }
        Ok(())
    }

    /// The command dropped its stdin; later chunks go nowhere.
    fn discard_stdin(&mut self) {
        tracing::trace!("[{}] Command no longer reads stdin", self.session.peer);
        self.pending_stdin.clear();
        self.stdin = None;
    }

    /// Drops the sender once END_STDIN arrived and the queue is empty.
    /// Dropping the sender is what the command sees as EOF.
    fn finish_stdin_if_drained(&mut self) {
        if self.stdin_ended && self.pending_stdin.is_empty() {
            self.stdin = None;
        }
    }

    async fn on_command_done(
        &mut self,
        joined: Result<Result<i32, ProtocolError>, JoinError>,
    ) -> SessionEnd {
        let code = match joined {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return SessionEnd::WriteFailed(e),
            Err(e) => {
                tracing::error!("[{}] Command task failed: {}", self.session.peer, e);
                if let Err(e) = self
                    .writer
                    .send_chunks(ChunkKind::Stderr, b"ERROR: command panicked\n")
                    .await
                {
                    return SessionEnd::WriteFailed(e);
                }
                1
            }
        };

        self.session.begin_closing();
        if let Err(e) = self.writer.send_exit(code).await {
            return SessionEnd::WriteFailed(e);
        }
        self.exit_code = Some(code);
        tracing::info!("[{}] Exit: {}", self.session.peer, code);

        if let Err(e) = self.writer.send_close().await {
            tracing::debug!("[{}] Failed to send CLOSE: {}", self.session.peer, e);
        }
        SessionEnd::Completed
    }

    /// Releases everything the session holds. Runs once per session.
    fn handle_close(&mut self) {
        if !self.session.close() {
            return;
        }
        self.stdin = None;
        self.pending_stdin.clear();
        if let Some(command) = self.command.take() {
            tracing::debug!("[{}] Aborting running command", self.session.peer);
            command.abort();
        }
    }

    async fn send_close_quietly(&self) {
        if self.session.is_closed() {
            return;
        }
        if let Err(e) = self.writer.send_close().await {
            tracing::debug!("[{}] Failed to send CLOSE: {}", self.session.peer, e);
        }
    }
}

async fn run_command(
    dispatcher: Arc<dyn Dispatcher>,
    invocation: Option<Invocation>,
    mut io: CommandIo,
) -> Result<i32, ProtocolError> {
    let Some(invocation) = invocation else {
        io.stderr.write_line("No command specified").await?;
        return Ok(2);
    };

    let command = invocation.command.clone();
    match dispatcher.dispatch(invocation, &mut io).await {
        Ok(code) => Ok(code),
        Err(DispatchError::Output(e)) => Err(e),
        Err(e) => {
            tracing::info!("Command {} failed: {}", command, e);
            io.stderr.write_line(&e.stderr_message()).await?;
            Ok(e.exit_code())
        }
    }
}

async fn wait_command(
    command: &mut Option<CommandTask>,
) -> Result<Result<i32, ProtocolError>, JoinError> {
    match command {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn reserve_stdin(
    stdin: Option<mpsc::Sender<Bytes>>,
) -> Option<mpsc::OwnedPermit<Bytes>> {
    match stdin {
        Some(tx) => tx.reserve_owned().await.ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Serves one session over an established transport.
///
/// Spawns the framed reader, runs the server side to completion, then stops
/// the reader and shuts down the write direction.
pub async fn serve_session<R, W>(
    reader: R,
    writer: W,
    peer: impl Into<String>,
    dispatcher: Arc<dyn Dispatcher>,
    options: SessionOptions,
    shutdown: Option<broadcast::Receiver<()>>,
) -> SessionSummary
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let peer = peer.into();
    let (reader_task, events) = FramedReader::new(reader, peer.clone())
        .with_read_buffer_size(options.read_buffer_size)
        .spawn();
    let writer = Arc::new(FramedWriter::new(writer));

    let mut side = ServerSide::new(peer, writer.clone(), dispatcher, options);
    if let Some(shutdown) = shutdown {
        side = side.with_shutdown(shutdown);
    }
    let summary = side.run(events).await;

    reader_task.abort();
    let _ = writer.shutdown().await;
    summary
}
