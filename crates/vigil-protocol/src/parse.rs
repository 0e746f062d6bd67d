//! RESP reply parser.
//!
//! Works on a borrowed buffer and never consumes it: the caller reads
//! from the socket, calls [`parse_frame`], and on `Ok(None)` reads more
//! and tries again from the start.
//!
//! RESP2 nils (`$-1`, `*-1`) and the RESP3 `_` all decode to
//! [`Frame::Null`].

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Arrays nested deeper than this are rejected.
const MAX_DEPTH: usize = 32;

/// Upper bound on a declared array length.
const MAX_ELEMENTS: i64 = 1 << 20;

/// Upper bound on a declared bulk length (512 MB).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// The declared array length is untrusted, so preallocation is capped.
const PREALLOC_CAP: usize = 64;

/// Parses one frame from the front of `buf`.
///
/// Returns the frame and how many bytes it occupied, `Ok(None)` when the
/// buffer ends mid-frame, or an error for malformed input.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let mut reader = Reader { buf, pos: 0 };
    match reader.frame(0) {
        Ok(frame) => Ok(Some((frame, reader.pos))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn frame(&mut self, depth: usize) -> Result<Frame, ProtocolError> {
        let prefix = *self.buf.get(self.pos).ok_or(ProtocolError::Incomplete)?;
        self.pos += 1;

        match prefix {
            b'+' => self.text("simple string").map(Frame::Simple),
            b'-' => self.text("error string").map(Frame::Error),
            b':' => self.integer().map(Frame::Integer),
            b'_' => {
                self.line()?;
                Ok(Frame::Null)
            }
            b'$' => match self.length(MAX_BULK_LEN)? {
                None => Ok(Frame::Null),
                Some(len) => self.bulk(len).map(Frame::Bulk),
            },
            b'*' => {
                if depth >= MAX_DEPTH {
                    return Err(ProtocolError::NestingTooDeep(MAX_DEPTH));
                }
                let Some(count) = self.length(MAX_ELEMENTS)? else {
                    return Ok(Frame::Null);
                };
                let mut items = Vec::with_capacity(count.min(PREALLOC_CAP));
                for _ in 0..count {
                    items.push(self.frame(depth + 1)?);
                }
                Ok(Frame::Array(items))
            }
            other => Err(ProtocolError::InvalidPrefix(other)),
        }
    }

    /// Returns the bytes before the next `\r\n` and moves past it.
    fn line(&mut self) -> Result<&'a [u8], ProtocolError> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let mut from = 0;
        while let Some(i) = memchr::memchr(b'\r', &rest[from..]) {
            let cr = from + i;
            match rest.get(cr + 1) {
                Some(b'\n') => {
                    self.pos += cr + 2;
                    return Ok(&rest[..cr]);
                }
                Some(_) => from = cr + 1,
                None => break,
            }
        }
        Err(ProtocolError::Incomplete)
    }

    fn text(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let line = self.line()?;
        std::str::from_utf8(line)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(what))
    }

    fn integer(&mut self) -> Result<i64, ProtocolError> {
        parse_i64(self.line()?)
    }

    /// Reads a bulk or array length. `-1` is nil; anything else negative
    /// or above `max` is an error.
    fn length(&mut self, max: i64) -> Result<Option<usize>, ProtocolError> {
        match self.integer()? {
            -1 => Ok(None),
            n if n < 0 => Err(ProtocolError::InvalidFrameLength(n)),
            n if n > max => Err(ProtocolError::TooLarge(n)),
            n => Ok(Some(n as usize)),
        }
    }

    fn bulk(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        let end = self.pos + len;
        if self.buf.len() < end + 2 {
            return Err(ProtocolError::Incomplete);
        }
        if &self.buf[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::MissingTerminator);
        }
        let data = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end + 2;
        Ok(data)
    }
}

/// Parses a decimal i64 without going through `str`.
fn parse_i64(digits: &[u8]) -> Result<i64, ProtocolError> {
    let (negative, digits) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    // accumulate toward the sign so i64::MIN fits
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let d = i64::from(b - b'0');
        n = n
            .checked_mul(10)
            .and_then(|n| if negative { n.checked_sub(d) } else { n.checked_add(d) })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Frame {
        let (frame, used) = parse_frame(input).unwrap().expect("complete frame");
        assert_eq!(used, input.len());
        frame
    }

    fn bulk(s: &'static str) -> Frame {
        Frame::Bulk(Bytes::from_static(s.as_bytes()))
    }

    #[test]
    fn scalars() {
        assert_eq!(parse_all(b"+PONG\r\n"), Frame::Simple("PONG".into()));
        assert_eq!(
            parse_all(b"-LOADING still loading\r\n"),
            Frame::Error("LOADING still loading".into())
        );
        assert_eq!(parse_all(b":-9223372036854775808\r\n"), Frame::Integer(i64::MIN));
        assert_eq!(parse_all(b"$6\r\nmaster\r\n"), bulk("master"));
        assert_eq!(parse_all(b"$0\r\n\r\n"), bulk(""));
    }

    #[test]
    fn every_nil_form_is_null() {
        assert_eq!(parse_all(b"_\r\n"), Frame::Null);
        assert_eq!(parse_all(b"$-1\r\n"), Frame::Null);
        assert_eq!(parse_all(b"*-1\r\n"), Frame::Null);
    }

    #[test]
    fn bulk_may_contain_crlf() {
        assert_eq!(parse_all(b"$4\r\na\r\nb\r\n"), bulk("a\r\nb"));
    }

    #[test]
    fn master_role_reply() {
        let input = b"*3\r\n$6\r\nmaster\r\n:3129659\r\n*2\r\n*3\r\n$9\r\n127.0.0.1\r\n$4\r\n9001\r\n$7\r\n3129242\r\n*3\r\n$9\r\n127.0.0.1\r\n$4\r\n9002\r\n$7\r\n3129543\r\n";
        assert_eq!(
            parse_all(input),
            Frame::Array(vec![
                bulk("master"),
                Frame::Integer(3129659),
                Frame::Array(vec![
                    Frame::Array(vec![bulk("127.0.0.1"), bulk("9001"), bulk("3129242")]),
                    Frame::Array(vec![bulk("127.0.0.1"), bulk("9002"), bulk("3129543")]),
                ]),
            ])
        );
    }

    #[test]
    fn slave_role_reply() {
        let input = b"*5\r\n$5\r\nslave\r\n$9\r\n127.0.0.1\r\n:9000\r\n$9\r\nconnected\r\n:3167038\r\n";
        assert_eq!(
            parse_all(input),
            Frame::Array(vec![
                bulk("slave"),
                bulk("127.0.0.1"),
                Frame::Integer(9000),
                bulk("connected"),
                Frame::Integer(3167038),
            ])
        );
    }

    #[test]
    fn partial_input_waits_for_more() {
        let inputs: [&[u8]; 6] = [
            b"",
            b"+OK",
            b"+OK\r",
            b"$6\r\nmas",
            b"$6\r\nmaster\r",
            b"*2\r\n:1\r\n",
        ];
        for input in inputs {
            assert_eq!(parse_frame(input).unwrap(), None, "{input:?}");
        }
    }

    #[test]
    fn stops_after_first_frame() {
        let (frame, used) = parse_frame(b"+OK\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Simple("OK".into()));
        assert_eq!(used, 5);
    }

    #[test]
    fn malformed_input() {
        assert_eq!(parse_frame(b"~1\r\n"), Err(ProtocolError::InvalidPrefix(b'~')));
        assert_eq!(parse_frame(b":12a\r\n"), Err(ProtocolError::InvalidInteger));
        assert_eq!(parse_frame(b"$-2\r\n"), Err(ProtocolError::InvalidFrameLength(-2)));
        assert_eq!(parse_frame(b"$2\r\nabcd\r\n"), Err(ProtocolError::MissingTerminator));
        assert_eq!(
            parse_frame(b"+\xff\r\n"),
            Err(ProtocolError::InvalidUtf8("simple string"))
        );
        assert_eq!(
            parse_frame(b"$536870913\r\n"),
            Err(ProtocolError::TooLarge(536870913))
        );
    }

    #[test]
    fn nesting_is_bounded() {
        let mut input = b"*1\r\n".repeat(MAX_DEPTH + 1);
        input.extend_from_slice(b":1\r\n");
        assert_eq!(
            parse_frame(&input),
            Err(ProtocolError::NestingTooDeep(MAX_DEPTH))
        );

        let mut ok = b"*1\r\n".repeat(MAX_DEPTH);
        ok.extend_from_slice(b":1\r\n");
        assert!(parse_frame(&ok).unwrap().is_some());
    }

    #[test]
    fn integer_bounds() {
        assert_eq!(parse_i64(b"9223372036854775807"), Ok(i64::MAX));
        assert_eq!(parse_i64(b"9223372036854775808"), Err(ProtocolError::InvalidInteger));
        assert_eq!(parse_i64(b"-"), Err(ProtocolError::InvalidInteger));
        assert_eq!(parse_i64(b""), Err(ProtocolError::InvalidInteger));
    }
}
