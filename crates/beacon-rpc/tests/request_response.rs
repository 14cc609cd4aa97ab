// ABOUTME: Integration tests for traffic over an established agent connection.
// ABOUTME: Requests, sends, collector commands, unsupported commands and timeouts.

mod common;

use std::time::Duration;

use beacon_rpc::beacon_proto::ErrorCode;
use beacon_rpc::{ConnectionState, RpcError};
use bytes::Bytes;
use common::{agent, collector, identity, WAIT};

#[tokio::test]
async fn test_agent_request_is_answered_by_collector() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let reply = client.request(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(&reply[..], b"hello");
    let reply = client.request(Bytes::from_static(b"whoami")).await.unwrap();
    assert_eq!(&reply[..], b"a1");
    assert_eq!(client.connection().pending_requests(), 0);
    factory.release();
}

#[tokio::test]
async fn test_concurrent_requests_each_get_their_own_response() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let requests = (0..50).map(|i| {
        let client = client.clone();
        async move {
            let payload = Bytes::from(format!("req-{}", i));
            let reply = client.request(payload.clone()).await.unwrap();
            assert_eq!(reply, payload);
        }
    });
    futures::future::join_all(requests).await;
    factory.release();
}

#[tokio::test]
async fn test_send_reaches_collector_listener() {
    let (acceptor, mut sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    client.send(Bytes::from_static(b"heartbeat")).await.unwrap();
    let received = tokio::time::timeout(WAIT, sends.recv()).await.unwrap().unwrap();
    assert_eq!(&received[..], b"heartbeat");
    factory.release();
}

#[tokio::test]
async fn test_collector_command_runs_on_agent() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let _client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let reply = acceptor
        .send_command(&identity("a1"), "echo", Bytes::from_static(b"ping"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"ping");

    let err = acceptor
        .send_command(&identity("a1"), "fail", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote { code: ErrorCode::HandlerFailed, ref message } if message == "disk full"
    ));
    factory.release();
}

#[tokio::test]
async fn test_unadvertised_command_fails_locally() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let err = acceptor
        .send_command(&identity("a1"), "heap-dump", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::UnsupportedCommand(t) if t == "heap-dump"));

    // Sent directly on the connection it reaches the agent's dispatcher.
    let server_side = acceptor.find(&identity("a1")).await.unwrap();
    let err = server_side
        .send_command("heap-dump", Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::UnsupportedCommand(t) if t == "heap-dump"));

    assert_eq!(client.current_state(), ConnectionState::RunDuplex);
    assert_eq!(server_side.current_state(), ConnectionState::RunDuplex);
    factory.release();
}

#[tokio::test]
async fn test_collector_request_to_agent_without_listener_is_unsupported() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let _client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let server_side = acceptor.find(&identity("a1")).await.unwrap();
    let err = server_side
        .request(Bytes::from_static(b"hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote { code: ErrorCode::Unsupported, .. }));
    factory.release();
}

#[tokio::test]
async fn test_request_timeout_leaves_connection_running() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let err = client.request(Bytes::from_static(b"slow")).await.unwrap_err();
    assert!(matches!(err, RpcError::ResponseTimeout { .. }));
    assert_eq!(client.current_state(), ConnectionState::RunDuplex);

    let reply = client.request(Bytes::from_static(b"after")).await.unwrap();
    assert_eq!(&reply[..], b"after");
    factory.release();
}

#[tokio::test]
async fn test_pending_request_fails_when_connection_drops() {
    let (acceptor, _sends) = collector().await;
    let factory = agent("a1", Duration::from_millis(50));
    let client = factory
        .connect_and_wait(acceptor.local_addr().to_string())
        .await
        .unwrap();

    let pending = client
        .request_future(Bytes::from_static(b"slow"))
        .await
        .unwrap();
    acceptor.find(&identity("a1")).await.unwrap().abort();

    let err = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RpcError::ConnectionTerminated | RpcError::ResponseTimeout { .. }
    ));
    factory.release();
}
