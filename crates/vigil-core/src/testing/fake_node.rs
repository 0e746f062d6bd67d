//! A scripted store node that speaks just enough RESP for failover.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use vigil_protocol::{parse_frame, Frame};

use crate::role::LinkState;

/// The role a [`FakeNode`] reports to ROLE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeRole {
    Master {
        offset: i64,
        /// `(ip:port, offset)` per slave.
        slaves: Vec<(String, i64)>,
    },
    Slave {
        master_host: String,
        master_port: u16,
        state: LinkState,
        offset: i64,
    },
}

impl FakeRole {
    pub fn name(&self) -> &'static str {
        match self {
            FakeRole::Master { .. } => "master",
            FakeRole::Slave { .. } => "slave",
        }
    }

    fn offset(&self) -> i64 {
        match self {
            FakeRole::Master { offset, .. } | FakeRole::Slave { offset, .. } => *offset,
        }
    }

    fn to_frame(&self) -> Frame {
        match self {
            FakeRole::Master { offset, slaves } => Frame::Array(vec![
                bulk("master"),
                Frame::Integer(*offset),
                Frame::Array(
                    slaves
                        .iter()
                        .map(|(addr, offset)| {
                            let (ip, port) = addr.rsplit_once(':').unwrap_or((addr, "0"));
                            Frame::Array(vec![bulk(ip), bulk(port), bulk(&offset.to_string())])
                        })
                        .collect(),
                ),
            ]),
            FakeRole::Slave {
                master_host,
                master_port,
                state,
                offset,
            } => Frame::Array(vec![
                bulk("slave"),
                bulk(master_host),
                Frame::Integer(i64::from(*master_port)),
                bulk(&state.to_string()),
                Frame::Integer(*offset),
            ]),
        }
    }
}

#[derive(Debug)]
struct FakeState {
    role: FakeRole,
    down: bool,
    fail_slaveof: bool,
    commands: Vec<Vec<String>>,
    connections: usize,
}

/// A RESP server on a random local port answering ROLE, PING and SLAVEOF.
///
/// While down it accepts connections and closes them without answering,
/// which looks like a dead node to the client. SLAVEOF changes the
/// reported role the way a real node would.
pub struct FakeNode {
    addr: String,
    state: Arc<Mutex<FakeState>>,
    accept: JoinHandle<()>,
}

impl FakeNode {
    pub async fn start(role: FakeRole) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake node");
        let addr = listener.local_addr().expect("local addr").to_string();
        let state = Arc::new(Mutex::new(FakeState {
            role,
            down: false,
            fail_slaveof: false,
            commands: Vec::new(),
            connections: 0,
        }));

        let shared = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let down = {
                    let mut state = lock(&shared);
                    state.connections += 1;
                    state.down
                };
                if down {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    /// A master reporting the given `(ip:port, offset)` slaves.
    pub async fn master(offset: i64, slaves: &[(&str, i64)]) -> Self {
        Self::start(FakeRole::Master {
            offset,
            slaves: slaves.iter().map(|(a, o)| (a.to_string(), *o)).collect(),
        })
        .await
    }

    /// A slave of `master` (`host:port`).
    pub async fn slave(master: &str, state: LinkState, offset: i64) -> Self {
        let (host, port) = master.rsplit_once(':').unwrap_or((master, "0"));
        Self::start(FakeRole::Slave {
            master_host: host.to_string(),
            master_port: port.parse().unwrap_or(0),
            state,
            offset,
        })
        .await
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Makes the node drop every connection, current and new.
    pub fn set_down(&self, down: bool) {
        lock(&self.state).down = down;
    }

    /// Makes SLAVEOF answer with an error reply.
    pub fn fail_slaveof(&self, fail: bool) {
        lock(&self.state).fail_slaveof = fail;
    }

    pub fn set_role(&self, role: FakeRole) {
        lock(&self.state).role = role;
    }

    pub fn role(&self) -> FakeRole {
        lock(&self.state).role.clone()
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.state).commands.clone()
    }

    /// How many times `name` was received.
    pub fn count(&self, name: &str) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|c| c.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .count()
    }

    /// Connections accepted so far, including ones dropped while down.
    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        // open connections notice on their next command
        lock(&self.state).down = true;
        self.accept.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<FakeState>>) {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let frame = match parse_frame(&buf) {
            Ok(Some((frame, consumed))) => {
                let _ = buf.split_to(consumed);
                frame
            }
            Ok(None) => match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            },
            Err(_) => return,
        };

        let args: Vec<String> = match frame {
            Frame::Array(items) => items
                .iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect(),
            _ => return,
        };

        let reply = {
            let mut state = lock(&state);
            if state.down {
                return;
            }
            state.commands.push(args.clone());
            respond(&mut state, &args)
        };

        let mut out = BytesMut::new();
        reply.serialize(&mut out);
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

fn respond(state: &mut FakeState, args: &[String]) -> Frame {
    let name = args.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
    match name.as_str() {
        "PING" => Frame::Simple("PONG".into()),
        "ROLE" => state.role.to_frame(),
        "SLAVEOF" | "REPLICAOF" if state.fail_slaveof => {
            Frame::Error("ERR slaveof refused".into())
        }
        "SLAVEOF" | "REPLICAOF" => match (args.get(1), args.get(2)) {
            (Some(no), Some(one))
                if no.eq_ignore_ascii_case("no") && one.eq_ignore_ascii_case("one") =>
            {
                state.role = FakeRole::Master {
                    offset: state.role.offset(),
                    slaves: Vec::new(),
                };
                Frame::Simple("OK".into())
            }
            (Some(host), Some(port)) => match port.parse() {
                Ok(master_port) => {
                    state.role = FakeRole::Slave {
                        master_host: host.clone(),
                        master_port,
                        state: LinkState::Connect,
                        offset: state.role.offset(),
                    };
                    Frame::Simple("OK".into())
                }
                Err(_) => Frame::Error("ERR invalid port".into()),
            },
            _ => Frame::Error("ERR wrong number of arguments for 'slaveof' command".into()),
        },
        _ => Frame::Error(format!("ERR unknown command '{name}'")),
    }
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
