//! End-to-end failover against scripted store nodes.

use std::time::Duration;

use vigil_core::testing::{FakeNode, FakeRole};
use vigil_core::LinkState;
use vigil_integration::{eventually, ServerOptions, TestServer};

/// A master with two disconnected slaves at offsets 10 and 20.
async fn topology() -> (FakeNode, FakeNode, FakeNode) {
    let master = FakeNode::master(0, &[]).await;
    let low = FakeNode::slave(&master.addr(), LinkState::Connect, 10).await;
    let high = FakeNode::slave(&master.addr(), LinkState::Connect, 20).await;
    master.set_role(FakeRole::Master {
        offset: 30,
        slaves: vec![(low.addr(), 10), (high.addr(), 20)],
    });
    (master, low, high)
}

fn watching(master: &FakeNode, follow_promoted: bool) -> TestServer {
    TestServer::start_with(ServerOptions {
        masters: vec![master.addr()],
        check_interval: Some("100ms".into()),
        follow_promoted: Some(follow_promoted),
        ..Default::default()
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_master_is_replaced_by_most_caught_up_slave() {
    let (master, low, high) = topology().await;
    let server = watching(&master, true);

    // the first check learns the slaves
    let master = &master;
    assert!(eventually(Duration::from_secs(5), || async move { master.count("ROLE") > 0 }).await);
    master.set_down(true);

    let server = &server;
    let expected = vec![high.addr()];
    let expected = &expected;
    assert!(
        eventually(Duration::from_secs(10), || async move {
            server.masters().await == *expected
        })
        .await,
        "promoted slave never replaced the master: {:?}",
        server.masters().await
    );

    assert_eq!(high.role().name(), "master");
    assert_eq!(low.count("SLAVEOF"), 1);
    match low.role() {
        FakeRole::Slave { master_port, .. } => {
            assert_eq!(high.addr(), format!("127.0.0.1:{master_port}"));
        }
        other => panic!("low slave should follow the new master, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn promoted_master_dropped_without_follow() {
    let (master, _low, high) = topology().await;
    let server = watching(&master, false);

    let master = &master;
    assert!(eventually(Duration::from_secs(5), || async move { master.count("ROLE") > 0 }).await);
    master.set_down(true);

    let high = &high;
    assert!(eventually(Duration::from_secs(10), || async move { high.role().name() == "master" }).await);

    let server = &server;
    assert!(
        eventually(Duration::from_secs(5), || async move { server.masters().await.is_empty() })
            .await
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_registered_as_master_is_dropped() {
    let node = FakeNode::slave("10.0.0.1:6379", LinkState::Connected, 5).await;
    let server = watching(&node, true);

    let server = &server;
    assert!(
        eventually(Duration::from_secs(5), || async move { server.masters().await.is_empty() })
            .await
    );
    assert_eq!(node.count("SLAVEOF"), 0);
}
