//! Decoding of ROLE replies.
//!
//! A node's role is read live on every probe and matched explicitly:
//!
//! ```text
//! master:  ["master", <offset>, [[<ip>, <port>, <offset>], ...]]
//! slave:   ["slave", <master ip>, <master port>, <state>, <offset>]
//! ```

use std::fmt;

use vigil_protocol::Frame;

use crate::error::NodeError;

/// The replication role a node reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master {
        offset: i64,
        slaves: Vec<SlaveInfo>,
    },
    Slave {
        master_host: String,
        master_port: u16,
        state: LinkState,
        offset: i64,
    },
    /// Sentinels and anything newer we don't act on.
    Other(String),
}

/// One entry of a master's slave list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveInfo {
    pub addr: String,
    pub offset: i64,
}

/// State of a slave's replication link to its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connect,
    Connecting,
    Handshake,
    Sync,
    Connected,
    Unknown(String),
}

impl LinkState {
    fn parse(s: &str) -> Self {
        match s {
            "connect" => LinkState::Connect,
            "connecting" => LinkState::Connecting,
            "handshake" => LinkState::Handshake,
            "sync" => LinkState::Sync,
            "connected" => LinkState::Connected,
            other => LinkState::Unknown(other.to_string()),
        }
    }

    /// Whether the link shows the slave is still talking to its master.
    pub fn is_live(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Sync)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Connect => "connect",
            LinkState::Connecting => "connecting",
            LinkState::Handshake => "handshake",
            LinkState::Sync => "sync",
            LinkState::Connected => "connected",
            LinkState::Unknown(s) => s,
        };
        f.write_str(s)
    }
}

impl Role {
    /// The role name as the node reports it.
    pub fn name(&self) -> &str {
        match self {
            Role::Master { .. } => "master",
            Role::Slave { .. } => "slave",
            Role::Other(name) => name,
        }
    }

    /// Decodes a ROLE reply.
    pub fn from_frame(frame: Frame) -> Result<Role, NodeError> {
        let items = match frame {
            Frame::Array(items) => items,
            other => return Err(unexpected("ROLE reply is not an array", &other)),
        };
        let name = items
            .first()
            .and_then(Frame::as_str)
            .ok_or_else(|| NodeError::UnexpectedReply("ROLE reply has no role name".into()))?;

        match name {
            "master" => {
                let offset = integer_at(&items, 1, "master offset")?;
                let slaves = match items.get(2) {
                    Some(Frame::Array(entries)) => entries
                        .iter()
                        .map(decode_slave_entry)
                        .collect::<Result<Vec<_>, _>>()?,
                    // an empty list may come back as nil from some servers
                    Some(Frame::Null) | None => Vec::new(),
                    Some(other) => return Err(unexpected("slave list is not an array", other)),
                };
                Ok(Role::Master { offset, slaves })
            }
            "slave" | "replica" => {
                let master_host = string_at(&items, 1, "master host")?.to_string();
                let master_port = integer_at(&items, 2, "master port")?;
                let master_port = u16::try_from(master_port).map_err(|_| {
                    NodeError::UnexpectedReply(format!("master port {master_port} out of range"))
                })?;
                let state = LinkState::parse(string_at(&items, 3, "link state")?);
                let offset = integer_at(&items, 4, "slave offset")?;
                Ok(Role::Slave {
                    master_host,
                    master_port,
                    state,
                    offset,
                })
            }
            other => Ok(Role::Other(other.to_string())),
        }
    }
}

fn decode_slave_entry(entry: &Frame) -> Result<SlaveInfo, NodeError> {
    let Frame::Array(fields) = entry else {
        return Err(unexpected("slave entry is not an array", entry));
    };
    let ip = string_at(fields, 0, "slave ip")?;
    let port = string_or_integer_at(fields, 1, "slave port")?;
    let offset = integer_at(fields, 2, "slave offset")?;
    Ok(SlaveInfo {
        addr: format!("{ip}:{port}"),
        offset,
    })
}

fn string_at<'a>(items: &'a [Frame], idx: usize, what: &str) -> Result<&'a str, NodeError> {
    items
        .get(idx)
        .and_then(Frame::as_str)
        .ok_or_else(|| NodeError::UnexpectedReply(format!("missing {what}")))
}

fn integer_at(items: &[Frame], idx: usize, what: &str) -> Result<i64, NodeError> {
    items
        .get(idx)
        .and_then(Frame::as_integer)
        .ok_or_else(|| NodeError::UnexpectedReply(format!("missing {what}")))
}

fn string_or_integer_at(items: &[Frame], idx: usize, what: &str) -> Result<String, NodeError> {
    match items.get(idx) {
        Some(Frame::Integer(n)) => Ok(n.to_string()),
        _ => string_at(items, idx, what).map(str::to_string),
    }
}

fn unexpected(msg: &str, frame: &Frame) -> NodeError {
    NodeError::UnexpectedReply(format!("{msg}: {frame:?}"))
}
