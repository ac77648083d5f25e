//! Frame format for the plain CLI protocol.
//!
//! Every frame starts with a single kind byte. The rest depends on the kind:
//!
//! ```text
//! +------+-------------------------------------------+
//! | kind | payload                                   |
//! |  1 B |                                           |
//! +------+-------------------------------------------+
//! ARG, LOCALE, ENCODING   | len: u16 BE | UTF-8 text  |
//! STDIN, STDOUT, STDERR   | len: u16 BE | bytes (>0)  |
//! EXIT                    | status: i32 BE            |
//! START, END_STDIN, CLOSE | (nothing)                 |
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the length prefix on text and byte-chunk payloads.
const LENGTH_PREFIX_SIZE: usize = 2;

/// Size of the EXIT status payload.
const EXIT_PAYLOAD_SIZE: usize = 4;

/// Kind byte of a frame.
///
/// The byte values are part of the protocol contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Command name or argument (UTF-8).
    Arg = 0x00,
    /// Client locale identifier (UTF-8).
    Locale = 0x01,
    /// Client character encoding (UTF-8).
    Encoding = 0x02,
    /// Start running the command.
    Start = 0x03,
    /// Exit status of the command.
    Exit = 0x04,
    /// Chunk of stdin.
    Stdin = 0x05,
    /// End of stdin.
    EndStdin = 0x06,
    /// Chunk of stdout.
    Stdout = 0x07,
    /// Chunk of stderr.
    Stderr = 0x08,
    /// End of session.
    Close = 0x09,
}

impl FrameKind {
    /// All kinds, in kind-byte order.
    pub const ALL: [FrameKind; 10] = [
        FrameKind::Arg,
        FrameKind::Locale,
        FrameKind::Encoding,
        FrameKind::Start,
        FrameKind::Exit,
        FrameKind::Stdin,
        FrameKind::EndStdin,
        FrameKind::Stdout,
        FrameKind::Stderr,
        FrameKind::Close,
    ];

    /// Maps a kind byte to a kind, if it is a known one.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns whether a client may send this kind.
    pub fn is_client_to_server(self) -> bool {
        matches!(
            self,
            FrameKind::Arg
                | FrameKind::Locale
                | FrameKind::Encoding
                | FrameKind::Start
                | FrameKind::Stdin
                | FrameKind::EndStdin
                | FrameKind::Close
        )
    }

    /// Returns whether a server may send this kind.
    pub fn is_server_to_client(self) -> bool {
        matches!(
            self,
            FrameKind::Exit | FrameKind::Stdout | FrameKind::Stderr | FrameKind::Close
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Arg => "ARG",
            FrameKind::Locale => "LOCALE",
            FrameKind::Encoding => "ENCODING",
            FrameKind::Start => "START",
            FrameKind::Exit => "EXIT",
            FrameKind::Stdin => "STDIN",
            FrameKind::EndStdin => "END_STDIN",
            FrameKind::Stdout => "STDOUT",
            FrameKind::Stderr => "STDERR",
            FrameKind::Close => "CLOSE",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The three byte-chunk streams multiplexed over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Stdin,
    Stdout,
    Stderr,
}

impl ChunkKind {
    /// Wraps a chunk into a frame of this kind.
    pub fn frame(self, chunk: Bytes) -> Frame {
        match self {
            ChunkKind::Stdin => Frame::Stdin(chunk),
            ChunkKind::Stdout => Frame::Stdout(chunk),
            ChunkKind::Stderr => Frame::Stderr(chunk),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Arg(String),
    Locale(String),
    Encoding(String),
    Start,
    Exit(i32),
    Stdin(Bytes),
    EndStdin,
    Stdout(Bytes),
    Stderr(Bytes),
    Close,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Arg(_) => FrameKind::Arg,
            Frame::Locale(_) => FrameKind::Locale,
            Frame::Encoding(_) => FrameKind::Encoding,
            Frame::Start => FrameKind::Start,
            Frame::Exit(_) => FrameKind::Exit,
            Frame::Stdin(_) => FrameKind::Stdin,
            Frame::EndStdin => FrameKind::EndStdin,
            Frame::Stdout(_) => FrameKind::Stdout,
            Frame::Stderr(_) => FrameKind::Stderr,
            Frame::Close => FrameKind::Close,
        }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Arg(text) | Frame::Locale(text) | Frame::Encoding(text) => {
                LENGTH_PREFIX_SIZE + text.len()
            }
            Frame::Stdin(chunk) | Frame::Stdout(chunk) | Frame::Stderr(chunk) => {
                LENGTH_PREFIX_SIZE + chunk.len()
            }
            Frame::Exit(_) => EXIT_PAYLOAD_SIZE,
            Frame::Start | Frame::EndStdin | Frame::Close => 0,
        }
    }

    /// Encodes the frame into a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    ///
    /// Nothing is written if the frame is not encodable.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        self.validate()?;
        buf.reserve(self.encoded_len());
        buf.put_u8(self.kind().as_byte());
        match self {
            Frame::Arg(text) | Frame::Locale(text) | Frame::Encoding(text) => {
                put_prefixed(buf, text.as_bytes());
            }
            Frame::Stdin(chunk) | Frame::Stdout(chunk) | Frame::Stderr(chunk) => {
                put_prefixed(buf, chunk);
            }
            Frame::Exit(code) => buf.put_i32(*code),
            Frame::Start | Frame::EndStdin | Frame::Close => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let payload_len = match self {
            Frame::Arg(text) | Frame::Locale(text) | Frame::Encoding(text) => text.len(),
            Frame::Stdin(chunk) | Frame::Stdout(chunk) | Frame::Stderr(chunk) => {
                if chunk.is_empty() {
                    return Err(ProtocolError::EmptyChunk(self.kind()));
                }
                chunk.len()
            }
            Frame::Start | Frame::Exit(_) | Frame::EndStdin | Frame::Close => return Ok(()),
        };
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                kind: self.kind(),
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` and consumes exactly that frame's bytes,
    /// `Ok(None)` if more data is needed, or `Err` on a corrupt frame. Bytes
    /// are consumed only when a frame decodes successfully.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(&kind_byte) = buf.first() else {
            return Ok(None);
        };
        let kind = FrameKind::from_byte(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;

        match kind {
            FrameKind::Start | FrameKind::EndStdin | FrameKind::Close => {
                buf.advance(1);
                Ok(Some(match kind {
                    FrameKind::Start => Frame::Start,
                    FrameKind::EndStdin => Frame::EndStdin,
                    _ => Frame::Close,
                }))
            }
            FrameKind::Exit => {
                if buf.len() < 1 + EXIT_PAYLOAD_SIZE {
                    return Ok(None);
                }
                buf.advance(1);
                Ok(Some(Frame::Exit(buf.get_i32())))
            }
            FrameKind::Arg | FrameKind::Locale | FrameKind::Encoding => {
                let Some(len) = prefixed_len(buf) else {
                    return Ok(None);
                };
                let start = 1 + LENGTH_PREFIX_SIZE;
                let text = std::str::from_utf8(&buf[start..start + len])
                    .map_err(|_| ProtocolError::InvalidUtf8(kind))?
                    .to_owned();
                buf.advance(start + len);
                Ok(Some(match kind {
                    FrameKind::Arg => Frame::Arg(text),
                    FrameKind::Locale => Frame::Locale(text),
                    _ => Frame::Encoding(text),
                }))
            }
            FrameKind::Stdin | FrameKind::Stdout | FrameKind::Stderr => {
                let Some(len) = prefixed_len(buf) else {
                    return Ok(None);
                };
                if len == 0 {
                    return Err(ProtocolError::EmptyChunk(kind));
                }
                buf.advance(1 + LENGTH_PREFIX_SIZE);
                let chunk = buf.split_to(len).freeze();
                Ok(Some(match kind {
                    FrameKind::Stdin => Frame::Stdin(chunk),
                    FrameKind::Stdout => Frame::Stdout(chunk),
                    _ => Frame::Stderr(chunk),
                }))
            }
        }
    }
}

fn put_prefixed(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

/// Payload length of a length-prefixed frame at the front of `buf`, if the
/// whole frame is buffered.
fn prefixed_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 1 + LENGTH_PREFIX_SIZE {
        return None;
    }
    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < 1 + LENGTH_PREFIX_SIZE + len {
        return None;
    }
    Some(len)
}
