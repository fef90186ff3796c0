use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::tracing::prelude::*;

/// Longest line accepted before the partial line is discarded.
pub const MAX_LINE_LENGTH: usize = 4096;

/// Newline-delimited framing for the serial link.
///
/// Decoding yields each line with its `\n` (and any `\r` before it)
/// removed. Encoding writes the bytes it's given verbatim; callers append
/// the terminator.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes already scanned for a newline in `src`
    next_index: usize,
    discarding: bool,
}

impl Decoder for LineCodec {
    type Item = Vec<u8>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;

                    if self.discarding {
                        src.advance(end + 1);
                        self.discarding = false;
                        continue;
                    }

                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(end - 1);
                    }
                    return Ok(Some(line.to_vec()));
                }
                None if src.len() > MAX_LINE_LENGTH => {
                    if !self.discarding {
                        warn!(len = src.len(), "Discarding overlong line");
                    }
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(None);
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        self.next_index = 0;
        let line = src.split();
        Ok(Some(line.to_vec()))
    }
}

impl Encoder<&[u8]> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, bytes: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(bytes.len());
        dst.put_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_splits_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"12.3,45.6,78.9,0.0\nsecond\r\npart"[..]);

        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(lines, vec![b"12.3,45.6,78.9,0.0".to_vec(), b"second".to_vec()]);
        assert_eq!(&buf[..], b"part");
    }

    #[test]
    fn test_line_across_reads() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"1.0,2."[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"0,3.0,4.0\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b"1.0,2.0,3.0,4.0");
    }

    #[test]
    fn test_overlong_line_discarded() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_LINE_LENGTH + 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // Tail of the junk line is dropped too; the next line survives.
        buf.extend_from_slice(b"xxx\nok\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_eof_flushes_partial_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"tail"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap(), b"tail");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_verbatim() {
        let mut codec = LineCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(&b"0.0,0.0,0.0,0.0\n"[..], &mut dst).unwrap();
        assert_eq!(&dst[..], b"0.0,0.0,0.0,0.0\n");
    }
}
