// ABOUTME: Shared fixtures for beacon-rpc integration tests.
// ABOUTME: Starts a loopback collector and builds agent factories with short timers.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use beacon_rpc::{
    handler_fn, Acceptor, AgentIdentity, ClientFactory, ClientOptions, ConnectionOptions,
    HandlerError, MessageListener, RequestContext, RetryPolicy, ServerOptions,
};
use bytes::Bytes;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Collector listener: echoes requests, records sends, stalls on "slow".
pub struct RecordingListener {
    pub sends: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn handle_send(&self, _ctx: RequestContext, payload: Bytes) {
        let _ = self.sends.send(payload);
    }

    async fn handle_request(&self, ctx: RequestContext, payload: Bytes) -> Result<Bytes, HandlerError> {
        match &payload[..] {
            b"slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(payload)
            }
            b"whoami" => Ok(Bytes::from(ctx.agent.agent_id)),
            _ => Ok(payload),
        }
    }
}

pub fn connection_options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_request_timeout(Duration::from_millis(500))
        .with_timeout_check_interval(Duration::from_millis(20))
        .with_close_linger(Duration::from_millis(200))
}

pub fn server_options() -> ServerOptions {
    ServerOptions::default()
        .with_connection(connection_options())
        .with_server_id("collector-test")
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub fn client_options(retry_interval: Duration) -> ClientOptions {
    ClientOptions::default()
        .with_connection(connection_options())
        .with_connect_timeout(Duration::from_secs(1))
        .with_handshake_timeout(Duration::from_secs(1))
        .with_reconnect(RetryPolicy::default().with_interval(retry_interval))
}

/// Collector on an ephemeral loopback port with its accept loop running.
pub async fn collector() -> (Acceptor, mpsc::UnboundedReceiver<Bytes>) {
    let (sends, rx) = mpsc::unbounded_channel();
    let acceptor = Acceptor::bind("127.0.0.1:0", server_options(), RecordingListener { sends })
        .await
        .unwrap();
    acceptor.start();
    (acceptor, rx)
}

pub fn identity(agent_id: &str) -> AgentIdentity {
    AgentIdentity::new("app", agent_id, 1_700_000_000_000)
}

/// Agent factory with `echo` and `fail` command handlers.
pub fn agent(agent_id: &str, retry_interval: Duration) -> ClientFactory {
    ClientFactory::builder(identity(agent_id))
        .options(client_options(retry_interval))
        .register_command_handler(
            "echo",
            handler_fn(|_ctx: RequestContext, payload: Bytes| async move { Ok(payload) }),
        )
        .register_command_handler(
            "fail",
            handler_fn(|_ctx: RequestContext, _payload: Bytes| async move {
                Err(HandlerError::failed("disk full"))
            }),
        )
        .build()
        .unwrap()
}

/// A port with nothing listening on it.
pub fn dead_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("127.0.0.1:{}", port)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// Wait until the collector's registry holds exactly `count` agents.
pub async fn registry_settles(acceptor: &Acceptor, count: usize) -> bool {
    eventually(WAIT, || {
        let acceptor = acceptor.clone();
        async move { acceptor.list_connections().await.len() == count }
    })
    .await
}
