//! The HTTP control plane of a standalone server.

use reqwest::Method;
use vigil_integration::{ServerOptions, TestServer};

#[tokio::test]
async fn master_set_crud() {
    let server = TestServer::start();
    assert!(server.masters().await.is_empty());

    let (status, _) = server
        .send(Method::POST, "/master", "masters", "127.0.0.1:7002, 127.0.0.1:7001")
        .await;
    assert_eq!(status, 200);
    assert_eq!(server.masters().await, vec!["127.0.0.1:7001", "127.0.0.1:7002"]);

    // adding again is a no-op
    let (status, _) = server
        .send(Method::POST, "/master", "masters", "127.0.0.1:7001")
        .await;
    assert_eq!(status, 200);
    assert_eq!(server.masters().await.len(), 2);

    let (status, _) = server
        .send(Method::DELETE, "/master", "masters", "127.0.0.1:7001,127.0.0.1:9999")
        .await;
    assert_eq!(status, 200);
    assert_eq!(server.masters().await, vec!["127.0.0.1:7002"]);

    let (status, _) = server
        .send(Method::PUT, "/master", "masters", "127.0.0.1:7003,127.0.0.1:7004")
        .await;
    assert_eq!(status, 200);
    assert_eq!(server.masters().await, vec!["127.0.0.1:7003", "127.0.0.1:7004"]);
}

#[tokio::test]
async fn invalid_address_is_rejected() {
    let server = TestServer::start();

    let (status, body) = server
        .send(Method::POST, "/master", "masters", "127.0.0.1:7001,nonsense")
        .await;
    assert_eq!(status, 400);
    assert!(body.contains("nonsense"), "{body}");
    // nothing from the batch was applied
    assert!(server.masters().await.is_empty());
}

#[tokio::test]
async fn configured_masters_are_monitored_at_startup() {
    let server = TestServer::start_with(ServerOptions {
        masters: vec!["127.0.0.1:7001".into(), "127.0.0.1:7002".into()],
        ..Default::default()
    });
    assert_eq!(server.masters().await, vec!["127.0.0.1:7001", "127.0.0.1:7002"]);
}

#[tokio::test]
async fn cluster_requires_a_coordinator() {
    let server = TestServer::start();

    let (status, _) = server.get("/cluster").await;
    assert_eq!(status, 500);

    let (status, _) = server
        .send(Method::POST, "/cluster", "peers", "2:127.0.0.1:13001")
        .await;
    assert_eq!(status, 500);
}

#[tokio::test]
async fn unknown_routes_and_methods() {
    let server = TestServer::start();

    let (status, _) = server.get("/nope").await;
    assert_eq!(status, 404);

    let (status, _) = server.send(Method::PATCH, "/master", "masters", "").await;
    assert_eq!(status, 405);

    let (status, _) = server.send(Method::POST, "/health", "x", "").await;
    assert_eq!(status, 405);
}

#[tokio::test]
async fn health_and_metrics() {
    let server = TestServer::start();

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body, "ok");

    // generate at least one labelled request first
    server.get("/master").await;
    let (status, body) = server.get("/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("vigil_http_requests_total"), "{body}");
}
