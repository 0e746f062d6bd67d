//! Client for a single store node.
//!
//! A node keeps at most one connection, opened on first use and reused
//! until an exchange fails. Each logical operation makes a bounded number
//! of attempts with no delay between them; the supervisor's tick interval
//! is the backoff.

use std::time::Duration;

use tracing::debug;
use vigil_protocol::Frame;

use crate::connection::Connection;
use crate::error::NodeError;
use crate::role::Role;

/// Retry and timeout settings shared by every node of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// Attempts per logical operation.
    pub attempts: u32,
    pub connect_timeout: Duration,
    /// Bound on one request/response exchange.
    pub io_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// One store server as seen by its group.
#[derive(Debug)]
pub struct Node {
    addr: String,
    offset: i64,
    conn: Option<Connection>,
    options: NodeOptions,
}

impl Node {
    pub fn new(addr: impl Into<String>, options: NodeOptions) -> Self {
        Self {
            addr: addr.into(),
            offset: 0,
            conn: None,
            options,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Last known replication offset.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: i64) {
        self.offset = offset;
    }

    /// Queries the node's replication role.
    ///
    /// A master's reported offset becomes the node's last known offset.
    /// A slave's own offset is ignored: with its master link down it
    /// reports -1, so the offset its master last reported for it stands.
    pub async fn role(&mut self) -> Result<Role, NodeError> {
        let reply = self.command(&["ROLE"]).await?;
        let role = Role::from_frame(reply)?;
        if let Role::Master { offset, .. } = &role {
            self.offset = *offset;
        }
        Ok(role)
    }

    pub async fn ping(&mut self) -> Result<(), NodeError> {
        self.command(&["PING"]).await.map(|_| ())
    }

    /// Points the node at a new master, or detaches it with `None`.
    pub async fn slave_of(&mut self, master: Option<(&str, u16)>) -> Result<(), NodeError> {
        let reply = match master {
            None => self.command(&["SLAVEOF", "NO", "ONE"]).await?,
            Some((host, port)) => {
                let port = port.to_string();
                self.command(&["SLAVEOF", host, &port]).await?
            }
        };
        match reply {
            Frame::Simple(_) => Ok(()),
            other => Err(NodeError::UnexpectedReply(format!(
                "SLAVEOF answered {other:?}"
            ))),
        }
    }

    /// Drops the connection, if any.
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Runs one command with retries.
    ///
    /// A failed exchange leaves the stream in an unknown state, so the
    /// connection is discarded and the next attempt redials. Error replies
    /// are answers, not failures, and are returned without retrying.
    async fn command(&mut self, args: &[&str]) -> Result<Frame, NodeError> {
        let attempts = self.options.attempts.max(1);
        let mut last = NodeError::Disconnected;

        for attempt in 1..=attempts {
            match self.try_command(args).await {
                Ok(Frame::Error(msg)) => return Err(NodeError::Reply(msg)),
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    debug!(addr = %self.addr, attempt, "{} failed: {e}", args[0]);
                    self.conn = None;
                    last = e;
                }
            }
        }

        Err(NodeError::Unreachable {
            addr: self.addr.clone(),
            attempts,
            last: Box::new(last),
        })
    }

    async fn try_command(&mut self, args: &[&str]) -> Result<Frame, NodeError> {
        if self.conn.is_none() {
            self.conn = Some(Connection::connect(&self.addr, self.options.connect_timeout).await?);
        }
        let conn = self.conn.as_mut().ok_or(NodeError::Disconnected)?;
        conn.send_command(args, self.options.io_timeout).await
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), NodeError> {
    let invalid = || NodeError::InvalidAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host, port))
}
