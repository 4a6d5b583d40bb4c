//! Line codec for transcripts.
//!
//! Wraps LinesCodec for reading and writes one `\n`-terminated UTF-8 line per
//! transcript. Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest line a client will accept from the server.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Codec that frames transcripts as newline-terminated text.
///
/// Line breaks inside a transcript are replaced with spaces so each decoded chunk
/// stays exactly one line on the wire.
pub struct TranscriptCodec {
    inner: LinesCodec,
}

impl Default for TranscriptCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

impl Decoder for TranscriptCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src).map_err(into_io)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode_eof(src).map_err(into_io)
    }
}

impl<T: AsRef<str>> Encoder<T> for TranscriptCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = item.as_ref();
        dst.reserve(text.len() + 1);
        for ch in text.chars() {
            match ch {
                '\n' | '\r' => dst.put_u8(b' '),
                _ => {
                    let mut buf = [0u8; 4];
                    dst.put_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        dst.put_u8(b'\n');
        tracing::trace!(line_bytes = text.len() + 1, "Encoding transcript line");
        Ok(())
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "transcript line too long")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_newline() {
        let mut codec = TranscriptCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("hello world", &mut buf).unwrap();
        assert_eq!(&buf[..], b"hello world\n");
    }

    #[test]
    fn encode_empty_transcript_is_blank_line() {
        let mut codec = TranscriptCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(String::new(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"\n");
    }

    #[test]
    fn encode_flattens_embedded_newlines() {
        let mut codec = TranscriptCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("一\n二\r三", &mut buf).unwrap();
        assert_eq!(std::str::from_utf8(&buf).unwrap(), "一 二 三\n");
    }

    #[test]
    fn decode_splits_lines() {
        let mut codec = TranscriptCodec::new();
        let mut buf = BytesMut::from(&b"first\nsecond\npart"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("second"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("part"));
    }
}
