/*!
 * RESP Frame Codec
 *
 * Bidirectional translation between a tagged `Frame` and its RESP byte
 * form. The same codec frames client traffic and the append-only log, so
 * the wire format is also the on-disk format.
 *
 * Decoding works on a byte buffer and separates three outcomes: a complete
 * frame, "need more bytes", and a malformed frame.
 */

use crate::error::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt::Write;

/// Largest bulk payload accepted (512 MiB, the Redis limit)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted while decoding
pub const MAX_DEPTH: usize = 64;

/// A single RESP value
///
/// Arrays are recursive: their elements are frames themselves.
/// `Bulk(None)` and `Array(None)` are the reserved null forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+text\r\n`
    Simple(String),
    /// `-text\r\n`
    Error(String),
    /// `:n\r\n`
    Integer(i64),
    /// `$len\r\n<bytes>\r\n`, or `$-1\r\n` for null
    Bulk(Option<Bytes>),
    /// `*len\r\n<elements>`, or `*-1\r\n` for null
    Array(Option<Vec<Frame>>),
}

impl Frame {
    pub fn simple(s: impl Into<String>) -> Self {
        Frame::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Frame::Error(s.into())
    }

    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(b.into()))
    }

    pub fn null() -> Self {
        Frame::Bulk(None)
    }

    pub fn array(items: Vec<Frame>) -> Self {
        Frame::Array(Some(items))
    }

    /// Build a command frame (array of bulk strings) from its parts
    ///
    /// This is the shape clients send and the shape of every log record.
    pub fn command<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Frame::Array(Some(parts.into_iter().map(Frame::bulk).collect()))
    }

    /// View this frame as a command: a non-empty array of non-null bulk strings
    ///
    /// # Returns
    /// * `Some(args)` with the command name at index 0
    /// * `None` for any other shape
    pub fn to_command_args(&self) -> Option<Vec<Bytes>> {
        let items = match self {
            Frame::Array(Some(items)) if !items.is_empty() => items,
            _ => return None,
        };
        items
            .iter()
            .map(|item| match item {
                Frame::Bulk(Some(b)) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    /// Append the RESP encoding of this frame to `out`
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Frame::Simple(s) => write_simple(s, out),
            Frame::Error(s) => write_error(s, out),
            Frame::Integer(i) => write_integer(*i, out),
            Frame::Bulk(Some(b)) => write_bulk(b, out),
            Frame::Bulk(None) => write_null(out),
            Frame::Array(Some(items)) => {
                write_array_len(items.len(), out);
                for item in items {
                    item.encode(out);
                }
            }
            Frame::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

/// Decode one frame from the start of `buf`
///
/// # Returns
/// * `Ok(Some((frame, consumed)))` - a complete frame and how many bytes it used
/// * `Ok(None)` - the buffer holds only a prefix of a frame
/// * `Err(...)` - the bytes can never form a valid frame
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    decode_at(buf, 0, 0)
}

/// Decode exactly one frame from a buffer that is expected to be complete
///
/// An incomplete frame is reported as `ProtocolError::Truncated`.
pub fn decode_exact(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    decode(buf)?.ok_or(ProtocolError::Truncated)
}

/// Decode every complete frame buffered in `buf`
///
/// Consumed bytes are removed from the buffer; a trailing partial frame
/// stays in place until more data arrives. Used for pipelined requests
/// and for streaming the log.
pub fn decode_many(buf: &mut BytesMut, out: &mut Vec<Frame>) -> Result<(), ProtocolError> {
    while let Some((frame, consumed)) = decode(&buf[..])? {
        buf.advance(consumed);
        out.push(frame);
    }
    Ok(())
}

fn decode_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    let pos = pos + 1;

    match tag {
        b'+' | b'-' => {
            let Some((line, next)) = read_line(buf, pos)? else {
                return Ok(None);
            };
            let text = String::from_utf8_lossy(line).into_owned();
            let frame = if tag == b'+' { Frame::Simple(text) } else { Frame::Error(text) };
            Ok(Some((frame, next)))
        }
        b':' => {
            let Some((n, next)) = read_decimal_line(buf, pos)? else {
                return Ok(None);
            };
            Ok(Some((Frame::Integer(n), next)))
        }
        b'$' => {
            let Some((len, next)) = read_decimal_line(buf, pos)? else {
                return Ok(None);
            };
            if len == -1 {
                return Ok(Some((Frame::Bulk(None), next)));
            }
            if len < 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkTooLarge(len));
            }

            let len = len as usize;
            let end = next + len;
            if end + 2 > buf.len() {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::BadTerminator);
            }
            let payload = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((Frame::Bulk(Some(payload)), end + 2)))
        }
        b'*' => {
            let Some((len, mut cursor)) = read_decimal_line(buf, pos)? else {
                return Ok(None);
            };
            if len == -1 {
                return Ok(Some((Frame::Array(None), cursor)));
            }
            if len < 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            if depth >= MAX_DEPTH {
                return Err(ProtocolError::TooDeep(MAX_DEPTH));
            }

            // The declared count is untrusted; don't let it size the allocation
            let mut items = Vec::with_capacity((len as usize).min(64));
            for _ in 0..len {
                match decode_at(buf, cursor, depth + 1)? {
                    Some((item, next)) => {
                        items.push(item);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(Some(items)), cursor)))
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// Read a line starting at `pos`, up to the next `\n`
///
/// # Returns
/// * `(line_without_crlf, position_after_crlf)`
/// * `None` when no `\n` is buffered yet
fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let rest = &buf[pos..];
    let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if nl == 0 || rest[nl - 1] != b'\r' {
        return Err(ProtocolError::BadTerminator);
    }
    Ok(Some((&rest[..nl - 1], pos + nl + 1)))
}

/// Read a base-10 signed integer followed by `\r\n`
///
/// Used for integer frames and for bulk/array length headers.
fn read_decimal_line(buf: &[u8], pos: usize) -> Result<Option<(i64, usize)>, ProtocolError> {
    let Some((line, next)) = read_line(buf, pos)? else {
        return Ok(None);
    };
    let n = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))?;
    Ok(Some((n, next)))
}

//
// RESP Encoders
//
// Low-level writers used by `Frame::encode`. They append straight into the
// output buffer so replies never need an intermediate allocation.
//

/// Encode a simple string (`+OK\r\n`)
#[inline]
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.extend_from_slice(b"+");
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Encode an error (`-ERR ...\r\n`)
#[inline]
pub fn write_error(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.extend_from_slice(b"-");
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Encode an integer (`:<n>\r\n`)
#[inline]
pub fn write_integer(i: i64, out: &mut BytesMut) {
    // fmt::Write on BytesMut only fails on allocation failure
    let _ = write!(out, ":{}\r\n", i);
}

/// Encode a bulk string (`$<len>\r\n<data>\r\n`)
#[inline]
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    out.reserve(b.len() + 16);
    let _ = write!(out, "${}\r\n", b.len());
    out.extend_from_slice(b);
    out.extend_from_slice(b"\r\n");
}

/// Encode the null bulk string (`$-1\r\n`)
#[inline]
pub fn write_null(out: &mut BytesMut) {
    out.extend_from_slice(b"$-1\r\n");
}

/// Encode an array header (`*<count>\r\n`); elements follow separately
#[inline]
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    let _ = write!(out, "*{}\r\n", n);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_discriminator() {
        assert_eq!(decode(b"+OK\r\n").unwrap(), Some((Frame::simple("OK"), 5)));
        assert_eq!(decode(b"-ERR x\r\n").unwrap(), Some((Frame::error("ERR x"), 8)));
        assert_eq!(decode(b":-42\r\n").unwrap(), Some((Frame::Integer(-42), 6)));
        assert_eq!(decode(b"$3\r\nbar\r\n").unwrap(), Some((Frame::bulk("bar"), 9)));
        assert_eq!(decode(b"$-1\r\n").unwrap(), Some((Frame::null(), 5)));
        assert_eq!(decode(b"*-1\r\n").unwrap(), Some((Frame::Array(None), 5)));
        assert_eq!(decode(b"*0\r\n").unwrap(), Some((Frame::array(vec![]), 4)));
    }

    #[test]
    fn bulk_may_contain_crlf() {
        let (frame, used) = decode_exact(b"$4\r\na\r\nb\r\n").unwrap();
        assert_eq!(frame, Frame::bulk(&b"a\r\nb"[..]));
        assert_eq!(used, 10);
    }

    #[test]
    fn partial_input_needs_more() {
        for prefix in [&b"+OK"[..], b"+OK\r", b":12", b"$3\r\nba", b"$3\r\nbar\r", b"*2\r\n$1\r\na\r\n"] {
            assert_eq!(decode(prefix).unwrap(), None, "{:?}", prefix);
        }
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(decode(b"+OK\n"), Err(ProtocolError::BadTerminator));
        assert_eq!(decode(b":abc\r\n"), Err(ProtocolError::InvalidInteger("abc".into())));
        assert_eq!(decode(b"$3\r\nbarXY"), Err(ProtocolError::BadTerminator));
        assert_eq!(decode(b"$-5\r\n"), Err(ProtocolError::InvalidLength(-5)));
        assert_eq!(decode(b"?x\r\n"), Err(ProtocolError::UnknownType(b'?')));
        assert_eq!(decode(b"*1\r\n!oops\r\n"), Err(ProtocolError::UnknownType(b'!')));
    }

    #[test]
    fn oversized_bulk_is_rejected_before_buffering() {
        let header = format!("${}\r\n", MAX_BULK_LEN + 1);
        assert_eq!(decode(header.as_bytes()), Err(ProtocolError::BulkTooLarge(MAX_BULK_LEN + 1)));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let nested = "*1\r\n".repeat(MAX_DEPTH + 1) + ":1\r\n";
        assert_eq!(decode(nested.as_bytes()), Err(ProtocolError::TooDeep(MAX_DEPTH)));
    }

    #[test]
    fn encodes_nested_arrays_in_order() {
        let frame = Frame::array(vec![
            Frame::Integer(1),
            Frame::array(vec![Frame::simple("a"), Frame::null()]),
            Frame::Array(None),
        ]);
        assert_eq!(&frame.to_bytes()[..], b"*3\r\n:1\r\n*2\r\n+a\r\n$-1\r\n*-1\r\n");
    }

    #[test]
    fn command_args_require_bulk_array() {
        let cmd = Frame::command(["GET", "k"]);
        assert_eq!(cmd.to_command_args().unwrap(), vec![Bytes::from("GET"), Bytes::from("k")]);
        assert!(Frame::array(vec![]).to_command_args().is_none());
        assert!(Frame::array(vec![Frame::Integer(1)]).to_command_args().is_none());
        assert!(Frame::array(vec![Frame::null()]).to_command_args().is_none());
        assert!(Frame::simple("PING").to_command_args().is_none());
    }

    #[test]
    fn decode_many_keeps_partial_tail() {
        let mut buf = BytesMut::from(&b"+a\r\n:1\r\n$3\r\nfo"[..]);
        let mut out = Vec::new();
        decode_many(&mut buf, &mut out).unwrap();
        assert_eq!(out, vec![Frame::simple("a"), Frame::Integer(1)]);
        assert_eq!(&buf[..], b"$3\r\nfo");
    }
}
