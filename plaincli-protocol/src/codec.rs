//! Buffered encoder and decoder for frame streams.

use crate::error::ProtocolError;
use crate::frame::Frame;
use bytes::{Bytes, BytesMut};
use std::fmt::Write;

/// Encodes frames into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a single frame.
    pub fn encode(frame: &Frame) -> Result<BytesMut, ProtocolError> {
        frame.encode()
    }

    /// Encodes a sequence of frames back to back into one buffer.
    pub fn encode_all<'a>(
        frames: impl IntoIterator<Item = &'a Frame>,
    ) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode_into(&mut buf)?;
        }
        Ok(buf)
    }
}

/// Accumulates bytes from a stream and decodes frames one at a time.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Removes and returns everything still buffered.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats raw bytes as `0x.. 0x..` for corruption diagnostics.
pub fn format_read_back(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 5);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:#04x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_decoding() {
        let encoded = Encoder::encode(&Frame::Arg("build".to_string())).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded[..3]);
        assert!(decoder.decode_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 3);

        decoder.extend(&encoded[3..]);
        let decoded = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(decoded, Frame::Arg("build".to_string()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_encode_all_preserves_order() {
        let frames = vec![
            Frame::Arg("a".to_string()),
            Frame::Arg("b".to_string()),
            Frame::Start,
        ];
        let encoded = Encoder::encode_all(&frames).unwrap();

        let mut decoder = Decoder::default();
        decoder.extend(&encoded);
        let mut decoded = Vec::new();
        while let Some(frame) = decoder.decode_frame().unwrap() {
            decoded.push(frame);
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_take_buffered() {
        let mut decoder = Decoder::new();
        decoder.extend(&[0xff, 0x01]);
        assert!(decoder.decode_frame().is_err());
        assert_eq!(decoder.take_buffered().as_ref(), &[0xff, 0x01]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_format_read_back() {
        assert_eq!(
            format_read_back(&[0xff, 0xff, 0xff, 0xff]),
            "0xff 0xff 0xff 0xff"
        );
        assert_eq!(format_read_back(&[0x00, 0x0a]), "0x00 0x0a");
        assert_eq!(format_read_back(&[]), "");
    }
}
