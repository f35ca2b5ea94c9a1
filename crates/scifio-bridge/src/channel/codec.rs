//! Wire codec for the worker pipes.
//!
//! Control traffic is newline-terminated text. Binary payloads are never
//! delimited: their length is announced on a preceding control line, and the
//! reader arms the decoder for exactly that many bytes before asking for the
//! next frame.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::CommandLine;

/// Longest control line accepted before the stream is declared garbage.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    Payload(Bytes),
}

#[derive(Debug)]
pub struct WireCodec {
    pending_payload: Option<usize>,
    next_index: usize,
    max_line_length: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            pending_payload: None,
            next_index: 0,
            max_line_length,
        }
    }

    /// Make the next decoded frame a payload of exactly `len` bytes.
    pub fn expect_payload(&mut self, len: usize) {
        self.pending_payload = Some(len);
    }

    fn decode_payload(&mut self, len: usize, src: &mut BytesMut) -> Option<Frame> {
        if src.len() < len {
            src.reserve(len - src.len());
            return None;
        }
        self.pending_payload = None;
        self.next_index = 0;
        Some(Frame::Payload(src.split_to(len).freeze()))
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        let search_end = src.len().min(self.max_line_length + 1);
        let newline = src[self.next_index..search_end]
            .iter()
            .position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let index = self.next_index + offset;
                self.next_index = 0;
                let raw = src.split_to(index + 1);
                let mut line = &raw[..index];
                if let [rest @ .., b'\r'] = line {
                    line = rest;
                }
                let text = std::str::from_utf8(line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(Frame::Line(text.to_string())))
            }
            None if src.len() > self.max_line_length => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {} bytes", self.max_line_length),
            )),
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.pending_payload {
            Some(len) => Ok(self.decode_payload(len, src)),
            None => self.decode_line(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended with {} undelivered bytes", src.len()),
            )),
        }
    }
}

impl Encoder<&CommandLine> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &CommandLine, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.to_string();
        tracing::trace!(line = %line, "Encoding command");
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Encoder<Bytes> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(payload_bytes = item.len(), "Encoding payload");
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Frame {
        Frame::Line(s.to_string())
    }

    #[test]
    fn decodes_lines_and_strips_terminators() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"order XYZ\r\nX 4 1.0\npart"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("order XYZ")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("X 4 1.0")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ial\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("partial")));
    }

    #[test]
    fn payload_may_contain_newlines() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"bytes 4\n\n\n\x00\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("bytes 4")));
        codec.expect_payload(4);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Payload(Bytes::from_static(b"\n\n\x00\n")))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn payload_waits_for_all_bytes() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"ab"[..]);
        codec.expect_payload(5);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"cde\ndone\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Payload(Bytes::from_static(b"abcde")))
        );
        // Back to line mode.
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(line("done")));
    }

    #[test]
    fn overlong_line_is_an_error() {
        let mut codec = WireCodec::with_max_line_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_payload_at_eof_is_unexpected_eof() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"abc"[..]);
        codec.expect_payload(10);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encodes_command_with_newline() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        let cmd = CommandLine::new("series").arg(2);
        codec.encode(&cmd, &mut buf).unwrap();
        assert_eq!(&buf[..], b"series 2\n");
    }
}
