//! Direct-to-buffer RESP serialization.
//!
//! Commands go out as arrays of bulk strings; the other variants exist so
//! test doubles can produce replies with the same code.

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

const CRLF: &[u8] = b"\r\n";

impl Frame {
    /// Appends the wire form of this frame to `dst`.
    ///
    /// Null is written the RESP2 way (`$-1`), which every store node
    /// version understands.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(dst, b'+', s.as_bytes()),
            Frame::Error(msg) => line(dst, b'-', msg.as_bytes()),
            Frame::Integer(n) => header(dst, b':', *n),
            Frame::Bulk(data) => {
                header(dst, b'$', data.len() as i64);
                dst.reserve(data.len() + CRLF.len());
                dst.put_slice(data);
                dst.put_slice(CRLF);
            }
            Frame::Array(items) => {
                header(dst, b'*', items.len() as i64);
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => header(dst, b'$', -1),
        }
    }

    /// Serializes into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf
    }
}

fn line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.reserve(1 + body.len() + CRLF.len());
    dst.put_u8(prefix);
    dst.put_slice(body);
    dst.put_slice(CRLF);
}

/// Writes `<prefix><n>\r\n`, formatting `n` with `itoa` on the stack.
fn header(dst: &mut BytesMut, prefix: u8, n: i64) {
    let mut digits = itoa::Buffer::new();
    line(dst, prefix, digits.format(n).as_bytes());
}
