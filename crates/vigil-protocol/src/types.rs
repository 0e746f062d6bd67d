//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed value. Bulk strings use
//! `Bytes` so replies can be moved around without copying.

use bytes::Bytes;

/// A single RESP protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Nil, from `$-1\r\n`, `*-1\r\n`, or `_\r\n`.
    Null,
}

impl Frame {
    /// Builds a command frame: an array of bulk strings.
    pub fn command<'a>(args: impl IntoIterator<Item = &'a str>) -> Frame {
        Frame::Array(
            args.into_iter()
                .map(|a| Frame::Bulk(Bytes::copy_from_slice(a.as_bytes())))
                .collect(),
        )
    }

    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns the textual content of a simple or bulk string.
    ///
    /// Bulk strings that are not valid utf-8 yield `None`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns an integer value, accepting both `:n` and numeric strings.
    ///
    /// Store nodes are inconsistent about this: ROLE reports the master's
    /// own offset as an integer but per-slave offsets as bulk strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            other => other.as_str()?.parse().ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_builds_bulk_array() {
        let frame = Frame::command(["SLAVEOF", "10.0.0.1", "6379"]);
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"SLAVEOF")),
                Frame::Bulk(Bytes::from_static(b"10.0.0.1")),
                Frame::Bulk(Bytes::from_static(b"6379")),
            ])
        );
    }

    #[test]
    fn is_null() {
        assert!(Frame::Null.is_null());
        assert!(!Frame::Simple("OK".into()).is_null());
        assert!(!Frame::Integer(0).is_null());
    }

    #[test]
    fn as_str_reads_simple_and_bulk() {
        assert_eq!(Frame::Simple("PONG".into()).as_str(), Some("PONG"));
        assert_eq!(Frame::Bulk(Bytes::from_static(b"slave")).as_str(), Some("slave"));
        assert_eq!(Frame::Bulk(Bytes::from_static(b"\xff")).as_str(), None);
        assert_eq!(Frame::Integer(1).as_str(), None);
        assert_eq!(Frame::Error("ERR".into()).as_str(), None);
    }

    #[test]
    fn as_integer_accepts_numeric_strings() {
        assert_eq!(Frame::Integer(42).as_integer(), Some(42));
        assert_eq!(Frame::Bulk(Bytes::from_static(b"3129242")).as_integer(), Some(3129242));
        assert_eq!(Frame::Simple("-7".into()).as_integer(), Some(-7));
        assert_eq!(Frame::Bulk(Bytes::from_static(b"nope")).as_integer(), None);
        assert_eq!(Frame::Null.as_integer(), None);
    }
}
