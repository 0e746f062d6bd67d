//! vigil-protocol: the RESP subset vigil speaks to store nodes.
//!
//! Replies are parsed from buffered bytes and commands are serialized
//! straight into a `BytesMut`.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use vigil_protocol::{Frame, parse_frame};
//!
//! let (frame, _) = parse_frame(b"$-1\r\n").unwrap().unwrap();
//! assert!(frame.is_null());
//!
//! let mut buf = BytesMut::new();
//! Frame::command(["SLAVEOF", "NO", "ONE"]).serialize(&mut buf);
//! assert_eq!(&buf[..], b"*3\r\n$7\r\nSLAVEOF\r\n$2\r\nNO\r\n$3\r\nONE\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use types::Frame;
