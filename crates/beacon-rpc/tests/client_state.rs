// ABOUTME: Integration tests for connection state attribution over loopback TCP.
// ABOUTME: Covers connect failure, both graceful closes, aborts on either side and release.

mod common;

use std::time::Duration;

use beacon_rpc::{ConnectionState, SupervisorState};
use common::{agent, collector, dead_addr, eventually, identity, registry_settles, WAIT};

#[tokio::test]
async fn test_no_server_ends_in_connect_failed() {
    let factory = agent("a1", Duration::from_secs(30));
    let client = factory.connect(dead_addr());

    let state = client
        .wait_for_state(|s| s == ConnectionState::ConnectFailed, Duration::from_secs(2))
        .await;
    assert_eq!(state, Some(ConnectionState::ConnectFailed));
    let scheduled = eventually(WAIT, || {
        let client = client.clone();
        async move { client.supervisor_state() == SupervisorState::Scheduled }
    })
    .await;
    assert!(scheduled);
    factory.release();
    assert_eq!(client.supervisor_state(), SupervisorState::Released);
}

#[tokio::test]
async fn test_client_close_is_closed_by_client_on_both_ends() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();
    assert_eq!(client.current_state(), ConnectionState::RunDuplex);
    assert_eq!(client.connection().server_id(), Some("collector-test"));

    let server_side = acceptor.find(&identity("a1")).await.unwrap();
    let transition = client.close().await;
    assert!(transition.accepted);
    assert_eq!(transition.current, ConnectionState::ClosedByClient);

    let server_state = tokio::time::timeout(WAIT, server_side.wait_for_terminal())
        .await
        .unwrap();
    assert_eq!(server_state, ConnectionState::ClosedByClient);
    assert_eq!(client.supervisor_state(), SupervisorState::Released);
    assert!(registry_settles(&acceptor, 0).await);
}

#[tokio::test]
async fn test_close_all_is_closed_by_server_without_reconnect() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    assert_eq!(acceptor.close_all().await, 1);
    let state = tokio::time::timeout(WAIT, client.connection().wait_for_terminal())
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::ClosedByServer);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.attempts(), 1);
    assert_eq!(client.current_state(), ConnectionState::ClosedByServer);
    factory.release();
}

#[tokio::test]
async fn test_server_abort_is_unexpected_close_by_server_and_reconnects() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();
    let first = client.connection();

    let server_side = acceptor.find(&identity("a1")).await.unwrap();
    server_side.abort();
    assert_eq!(
        server_side.wait_for_terminal().await,
        ConnectionState::UnexpectedCloseByServer
    );
    let state = tokio::time::timeout(WAIT, first.wait_for_terminal())
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::UnexpectedCloseByServer);

    let reconnected = eventually(WAIT, || {
        let client = client.clone();
        let first_id = first.id();
        async move { client.connection().id() != first_id && client.connection().is_running() }
    })
    .await;
    assert!(reconnected);
    assert!(client.attempts() >= 2);
    assert!(registry_settles(&acceptor, 1).await);
    factory.release();
}

#[tokio::test]
async fn test_release_is_unexpected_close_by_client_without_reconnect() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();
    let server_side = acceptor.find(&identity("a1")).await.unwrap();

    factory.release();
    let state = tokio::time::timeout(WAIT, client.connection().wait_for_terminal())
        .await
        .unwrap();
    assert_eq!(state, ConnectionState::UnexpectedCloseByClient);

    let server_state = tokio::time::timeout(WAIT, server_side.wait_for_terminal())
        .await
        .unwrap();
    assert_eq!(server_state, ConnectionState::UnexpectedCloseByClient);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.attempts(), 1);
    assert_eq!(client.supervisor_state(), SupervisorState::Released);
}

#[tokio::test]
async fn test_background_connect_retries_until_collector_appears() {
    let addr = dead_addr();
    let factory = agent("a1", Duration::from_millis(100));
    let client = factory.connect(addr.clone());

    let failed = client
        .wait_for_state(|s| s == ConnectionState::ConnectFailed, WAIT)
        .await;
    assert_eq!(failed, Some(ConnectionState::ConnectFailed));

    let (sends, _rx) = tokio::sync::mpsc::unbounded_channel();
    let acceptor = beacon_rpc::Acceptor::bind(
        addr.as_str(),
        common::server_options(),
        common::RecordingListener { sends },
    )
    .await
    .unwrap();
    acceptor.start();

    let running = client
        .wait_for_state(|s| s == ConnectionState::RunDuplex, WAIT)
        .await;
    assert_eq!(running, Some(ConnectionState::RunDuplex));
    assert!(client.attempts() >= 2);
    factory.release();
}
