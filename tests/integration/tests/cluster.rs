//! A single-node raft cluster behind the control plane.

use std::time::Duration;

use reqwest::Method;
use vigil_integration::{eventually, ServerOptions, TestServer};

/// Retries a mutation until this node has won its election.
async fn send_as_leader(server: &TestServer, method: Method, path: &str, field: &str, value: &str) {
    let ok = eventually(Duration::from_secs(10), || {
        let method = method.clone();
        async move { server.send(method, path, field, value).await.0 == 200 }
    })
    .await;
    assert!(ok, "{path} never accepted {value}");
}

#[tokio::test]
async fn cluster_lists_its_members() {
    let server = TestServer::start_with(ServerOptions {
        raft: true,
        ..Default::default()
    });
    let raft_port = server.raft_port.unwrap();

    let server = &server;
    let expected = format!("1:127.0.0.1:{raft_port}");
    let expected = &expected;
    assert!(
        eventually(Duration::from_secs(10), || async move {
            server.get("/cluster").await == (200, expected.clone())
        })
        .await
    );

    let (status, _) = server
        .send(Method::POST, "/cluster", "peers", "bogus")
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn masters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let raft_port = vigil_integration::find_free_port();

    {
        let server = TestServer::start_with(ServerOptions {
            raft: true,
            raft_port: Some(raft_port),
            data_dir_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        send_as_leader(&server, Method::POST, "/master", "masters", "127.0.0.1:7001,127.0.0.1:7002")
            .await;
        send_as_leader(&server, Method::DELETE, "/master", "masters", "127.0.0.1:7001").await;
        assert_eq!(server.masters().await, vec!["127.0.0.1:7002"]);
    }

    let server = TestServer::start_with(ServerOptions {
        raft: true,
        raft_port: Some(raft_port),
        data_dir_path: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    // the log is re-applied once the node wins its election again
    let server = &server;
    assert!(
        eventually(Duration::from_secs(10), || async move {
            server.masters().await == vec!["127.0.0.1:7002"]
        })
        .await
    );
    assert!(server.data_dir.join("raft").is_dir());
}
