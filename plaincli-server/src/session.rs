//! Server-side session state.
//!
//! A session walks `AwaitingArgs -> AwaitingStart -> Running -> Closing ->
//! Closed`. This type holds only the state and the phase rules; the handler
//! in [`crate::handler`] performs the I/O.

use crate::dispatch::Invocation;
use plaincli_protocol::{FrameKind, ProtocolError};
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No ARG received yet.
    AwaitingArgs,
    /// At least one ARG received, waiting for START.
    AwaitingStart,
    /// Command dispatched; stdin and output are streaming.
    Running,
    /// Command finished; EXIT and CLOSE are being sent.
    Closing,
    /// Session over. Nothing more is processed.
    Closed,
}

impl SessionState {
    fn phase(self) -> &'static str {
        match self {
            SessionState::AwaitingArgs => "awaiting arguments",
            SessionState::AwaitingStart => "awaiting start",
            SessionState::Running => "running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Returns whether START has not been seen yet.
    pub fn is_request_phase(self) -> bool {
        matches!(self, SessionState::AwaitingArgs | SessionState::AwaitingStart)
    }
}

/// State of one client session.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Peer label used in logs.
    pub peer: String,
    state: SessionState,
    args: Vec<String>,
    locale: Option<String>,
    encoding: Option<String>,
    stdin_open: bool,
    frames_received: u64,
}

impl Session {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.into(),
            state: SessionState::AwaitingArgs,
            args: Vec::new(),
            locale: None,
            encoding: None,
            stdin_open: true,
            frames_received: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Arguments received so far, command name first.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    fn unexpected(&self, kind: FrameKind) -> ProtocolError {
        ProtocolError::UnexpectedFrame {
            kind,
            phase: self.state.phase(),
        }
    }

    /// Appends an argument.
    pub fn on_arg(&mut self, text: String) -> Result<(), ProtocolError> {
        if !self.state.is_request_phase() {
            return Err(self.unexpected(FrameKind::Arg));
        }
        self.args.push(text);
        self.state = SessionState::AwaitingStart;
        Ok(())
    }

    /// Records the client locale.
    ///
    /// Returns `false` when the frame arrived after START; the client resends
    /// it as a keepalive and it changes nothing. A malformed name is logged
    /// and the previous locale kept.
    pub fn on_locale(&mut self, text: String) -> bool {
        if !self.state.is_request_phase() {
            return false;
        }
        if is_locale_name(&text) {
            self.locale = Some(text);
        } else {
            tracing::warn!("[{}] Unknown client locale {:?}", self.peer, text);
        }
        true
    }

    /// Records the client encoding. Same rules as [`Self::on_locale`].
    pub fn on_encoding(&mut self, text: String) -> bool {
        if !self.state.is_request_phase() {
            return false;
        }
        if is_charset_name(&text) {
            self.encoding = Some(text);
        } else {
            tracing::warn!("[{}] Unknown client charset {:?}", self.peer, text);
        }
        true
    }

    /// Moves to `Running`.
    pub fn on_start(&mut self) -> Result<(), ProtocolError> {
        if !self.state.is_request_phase() {
            return Err(self.unexpected(FrameKind::Start));
        }
        self.state = SessionState::Running;
        Ok(())
    }

    /// Checks that a stdin chunk may arrive now.
    pub fn on_stdin(&self) -> Result<(), ProtocolError> {
        if self.state != SessionState::Running {
            return Err(self.unexpected(FrameKind::Stdin));
        }
        if !self.stdin_open {
            return Err(ProtocolError::UnexpectedFrame {
                kind: FrameKind::Stdin,
                phase: "stdin is closed",
            });
        }
        Ok(())
    }

    /// Marks stdin exhausted.
    pub fn on_end_stdin(&mut self) -> Result<(), ProtocolError> {
        if self.state != SessionState::Running {
            return Err(self.unexpected(FrameKind::EndStdin));
        }
        if !self.stdin_open {
            return Err(ProtocolError::UnexpectedFrame {
                kind: FrameKind::EndStdin,
                phase: "stdin is closed",
            });
        }
        self.stdin_open = false;
        Ok(())
    }

    /// Builds the error for a frame the handler does not accept.
    ///
    /// Kinds only a server may send are rejected whatever the phase.
    pub fn reject(&self, kind: FrameKind) -> ProtocolError {
        if kind.is_client_to_server() {
            return self.unexpected(kind);
        }
        ProtocolError::UnexpectedFrame {
            kind,
            phase: "receiving from a client",
        }
    }

    /// Builds the invocation for the dispatcher. `None` if no ARG was sent.
    pub fn invocation(&self) -> Option<Invocation> {
        let (command, args) = self.args.split_first()?;
        Some(Invocation {
            command: command.clone(),
            args: args.to_vec(),
            locale: self.locale.clone(),
            encoding: self.encoding.clone(),
        })
    }

    pub fn begin_closing(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    /// Moves to `Closed`. Returns `false` if it already was.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn record_frame(&mut self) {
        self.frames_received += 1;
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }
}

/// `language[_TERRITORY[_variant]]`, as in `en`, `en_US` or `ja_JP_JP`.
fn is_locale_name(text: &str) -> bool {
    let mut parts = text.split('_');
    let language_ok = parts.next().is_some_and(|lang| {
        (2..=8).contains(&lang.len()) && lang.bytes().all(|b| b.is_ascii_alphabetic())
    });
    language_ok
        && parts.all(|part| {
            !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'#')
        })
}

/// IANA-style charset name such as `UTF-8`, `ISO-8859-1` or `windows-1252`.
fn is_charset_name(text: &str) -> bool {
    text.len() <= 40
        && text.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric())
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':' | b'+'))
}
