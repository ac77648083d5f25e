//! Protocol error types.

use crate::frame::FrameKind;
use thiserror::Error;

/// Errors raised while encoding, decoding, or exchanging frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("invalid UTF-8 in {0} payload")]
    InvalidUtf8(FrameKind),

    #[error("empty {0} chunk")]
    EmptyChunk(FrameKind),

    #[error("{kind} payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        kind: FrameKind,
        size: usize,
        max: usize,
    },

    #[error("unexpected {kind} frame while {phase}")]
    UnexpectedFrame { kind: FrameKind, phase: &'static str },

    #[error("cannot send {0} after CLOSE")]
    AlreadyClosed(FrameKind),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether this error means the peer sent undecodable bytes.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownKind(_)
                | ProtocolError::InvalidUtf8(_)
                | ProtocolError::EmptyChunk(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownKind(0xff);
        assert_eq!(err.to_string(), "unknown frame kind 0xff");

        let err = ProtocolError::InvalidUtf8(FrameKind::Locale);
        assert!(err.to_string().contains("LOCALE"));

        let err = ProtocolError::PayloadTooLarge {
            kind: FrameKind::Stdout,
            size: 70000,
            max: 65535,
        };
        assert!(err.to_string().contains("70000"));

        let err = ProtocolError::UnexpectedFrame {
            kind: FrameKind::Arg,
            phase: "running",
        };
        assert_eq!(err.to_string(), "unexpected ARG frame while running");
    }

    #[test]
    fn test_corruption_classification() {
        assert!(ProtocolError::UnknownKind(0x42).is_corruption());
        assert!(ProtocolError::EmptyChunk(FrameKind::Stdin).is_corruption());
        assert!(!ProtocolError::UnexpectedFrame {
            kind: FrameKind::Start,
            phase: "running",
        }
        .is_corruption());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(!ProtocolError::Io(io).is_corruption());
    }
}
