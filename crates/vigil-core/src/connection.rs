//! Async TCP connection to a store node.
//!
//! Sends commands as RESP arrays of bulk strings and reads back parsed
//! frames. Every exchange is bounded by a timeout so a hung node can't
//! stall its group past the retry budget.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use vigil_protocol::{parse_frame, Frame};

use crate::error::NodeError;

/// A TCP connection to a store node with read/write buffering.
#[derive(Debug)]
pub(crate) struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    /// Dials `addr`, giving up after `connect_timeout`.
    pub(crate) async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, NodeError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
        })
    }

    /// Sends one command and reads one reply, both within `io_timeout`.
    pub(crate) async fn send_command(
        &mut self,
        args: &[&str],
        io_timeout: Duration,
    ) -> Result<Frame, NodeError> {
        timeout(io_timeout, self.exchange(args))
            .await
            .map_err(|_| NodeError::Timeout(io_timeout))?
    }

    async fn exchange(&mut self, args: &[&str]) -> Result<Frame, NodeError> {
        self.write_buf.clear();
        Frame::command(args.iter().copied()).serialize(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Frame, NodeError> {
        loop {
            if !self.read_buf.is_empty() {
                if let Some((frame, consumed)) = parse_frame(&self.read_buf)? {
                    let _ = self.read_buf.split_to(consumed);
                    return Ok(frame);
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(NodeError::Disconnected);
            }
        }
    }
}
