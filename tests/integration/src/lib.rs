//! Test helpers for spawning a vigil-server and driving its control plane.

use std::future::Future;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use reqwest::{Client, Method};

/// Raft timings short enough for tests to elect a leader quickly.
const FAST_RAFT: &str = r#"
[raft]
heartbeat_interval = "50ms"
election_timeout_min = "300ms"
election_timeout_max = "600ms"
"#;

/// A vigil-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub port: u16,
    /// Set when the server runs a single-node raft cluster.
    pub raft_port: Option<u16>,
    pub data_dir: PathBuf,
    _data_dir: Option<tempfile::TempDir>,
    client: Client,
}

/// Options for starting a test server.
#[derive(Default)]
pub struct ServerOptions {
    pub masters: Vec<String>,
    /// Defaults to an hour so the supervisor leaves unreachable masters alone.
    pub check_interval: Option<String>,
    pub follow_promoted: Option<bool>,
    /// Run as a single-node raft cluster.
    pub raft: bool,
    /// Raft port to reuse, e.g. across a restart.
    pub raft_port: Option<u16>,
    /// Owned temp directory (cleaned up when the server drops).
    pub data_dir: Option<tempfile::TempDir>,
    /// Use an existing path without taking ownership. Wins over `data_dir`.
    pub data_dir_path: Option<PathBuf>,
}

impl TestServer {
    /// Starts a standalone vigil-server on a random port.
    pub fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    /// Starts a vigil-server with custom options.
    ///
    /// Blocks until the control plane accepts connections (up to 5 seconds).
    pub fn start_with(opts: ServerOptions) -> Self {
        let port = find_free_port();
        let binary = server_binary();

        let (owned_dir, data_dir) = match opts.data_dir_path {
            Some(path) => (None, path),
            None => {
                let dir = opts
                    .data_dir
                    .unwrap_or_else(|| tempfile::tempdir().unwrap());
                let path = dir.path().to_path_buf();
                (Some(dir), path)
            }
        };
        let config = data_dir.join("vigil.toml");
        std::fs::write(&config, FAST_RAFT).unwrap();

        let mut cmd = Command::new(&binary);
        cmd.arg("--config").arg(&config);
        cmd.arg("--addr").arg(format!("127.0.0.1:{port}"));
        cmd.arg("--data-dir").arg(&data_dir);
        cmd.arg("--check-interval")
            .arg(opts.check_interval.as_deref().unwrap_or("1h"));
        if !opts.masters.is_empty() {
            cmd.arg("--masters").arg(opts.masters.join(","));
        }
        if let Some(follow) = opts.follow_promoted {
            cmd.arg("--follow-promoted").arg(follow.to_string());
        }

        let raft_port = if opts.raft {
            let raft_port = opts.raft_port.unwrap_or_else(find_free_port);
            cmd.arg("--server-id").arg("1");
            cmd.arg("--cluster").arg(format!("1:127.0.0.1:{raft_port}"));
            Some(raft_port)
        } else {
            None
        };

        // suppress tracing output in tests
        cmd.env("RUST_LOG", "error");

        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| {
                panic!("failed to spawn vigil-server at {}: {e}", binary.display())
            });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                panic!("vigil-server failed to start within 5 seconds on port {port}");
            }
            if std::net::TcpStream::connect(format!("127.0.0.1:{port}")).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            child,
            port,
            raft_port,
            data_dir,
            _data_dir: owned_dir,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    /// Sends a GET and returns the status code and body.
    pub async fn get(&self, path: &str) -> (u16, String) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    /// Sends `field=value` as a form body with `method`.
    pub async fn send(&self, method: Method, path: &str, field: &str, value: &str) -> (u16, String) {
        let resp = self
            .client
            .request(method, self.url(path))
            .form(&[(field, value)])
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    /// The monitored masters as reported by `GET /master`.
    pub async fn masters(&self) -> Vec<String> {
        let (status, body) = self.get("/master").await;
        assert_eq!(status, 200, "GET /master failed: {body}");
        split(&body)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Splits a comma-joined response body.
pub fn split(body: &str) -> Vec<String> {
    body.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Polls `check` every 50ms until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Finds a free TCP port by binding to port 0.
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Locates the vigil-server binary in the cargo target directory.
fn server_binary() -> PathBuf {
    // test binaries live in target/<profile>/deps/
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("vigil-server");
    if !path.exists() {
        panic!(
            "vigil-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
