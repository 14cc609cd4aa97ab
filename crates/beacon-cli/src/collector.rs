// ABOUTME: The `beacon collector` command.
// ABOUTME: Accepts agents, echoes their requests, logs sends and registry changes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use beacon_rpc::{Acceptor, HandlerError, MessageListener, RegistryEvent, RequestContext};
use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;
use crate::signal::shutdown_signal;

/// Answers every request with its own payload and logs sends.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoListener;

#[async_trait]
impl MessageListener for EchoListener {
    async fn handle_send(&self, ctx: RequestContext, payload: Bytes) {
        info!(
            agent = %ctx.agent,
            bytes = payload.len(),
            payload = %String::from_utf8_lossy(&payload),
            "send from agent"
        );
    }

    async fn handle_request(&self, _ctx: RequestContext, payload: Bytes) -> Result<Bytes, HandlerError> {
        Ok(payload)
    }
}

pub async fn run(config: &Config) -> Result<()> {
    let acceptor = Acceptor::bind(
        config.collector.listen.as_str(),
        config.server_options(),
        EchoListener,
    )
    .await
    .with_context(|| format!("Failed to listen on {}", config.collector.listen))?;

    let events = tokio::spawn(log_registry_events(acceptor.clone()));
    let accept_loop = acceptor.start();

    shutdown_signal().await;

    let closed = acceptor.close_all().await;
    let _ = accept_loop.await;
    events.abort();
    info!(closed, "collector stopped");
    Ok(())
}

async fn log_registry_events(acceptor: Acceptor) {
    let mut events = acceptor.subscribe();
    loop {
        match events.recv().await {
            Ok(RegistryEvent::Added(registration)) => info!(
                agent = %registration.identity,
                remote = ?registration.remote_addr,
                commands = ?registration.supported_commands,
                "agent connected"
            ),
            Ok(RegistryEvent::Removed(registration)) => info!(
                agent = %registration.identity,
                "agent disconnected"
            ),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "registry event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
