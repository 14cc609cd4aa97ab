// ABOUTME: The `beacon agent` command.
// ABOUTME: Connects with automatic reconnection, serves echo/status commands, sends heartbeats.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use beacon_rpc::{
    handler_fn, AgentIdentity, Client, ClientFactory, CommandHandler, HandlerError,
    RequestContext,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::Config;
use crate::signal::shutdown_signal;

/// Answers the `status` command with a JSON summary of this agent.
pub struct StatusHandler {
    started: Instant,
}

impl StatusHandler {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for StatusHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    identity: &'a AgentIdentity,
    started_at: Option<DateTime<Utc>>,
    uptime_secs: u64,
    connection_id: String,
    server_id: &'a str,
}

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, ctx: RequestContext, _payload: Bytes) -> Result<Bytes, HandlerError> {
        let report = StatusReport {
            identity: &ctx.agent,
            started_at: Utc.timestamp_millis_opt(ctx.agent.start_timestamp).single(),
            uptime_secs: self.started.elapsed().as_secs(),
            connection_id: ctx.connection_id.to_string(),
            server_id: &ctx.server_id,
        };
        serde_json::to_vec(&report)
            .map(Bytes::from)
            .map_err(|e| HandlerError::failed(format!("failed to encode status: {}", e)))
    }
}

/// Agent factory with the built-in command handlers.
pub fn build_factory(config: &Config) -> Result<ClientFactory> {
    ClientFactory::builder(config.agent_identity())
        .options(config.client_options())
        .register_command_handler(
            "echo",
            handler_fn(|_ctx: RequestContext, payload: Bytes| async move { Ok(payload) }),
        )
        .register_command_handler("status", StatusHandler::new())
        .build()
        .context("Invalid agent configuration")
}

pub async fn run(config: &Config) -> Result<()> {
    let factory = build_factory(config)?;
    info!(
        agent = %factory.identity(),
        collector = %config.agent.collector,
        commands = ?factory.supported_commands(),
        "starting agent"
    );
    let client = factory.connect(config.agent.collector.clone());

    let heartbeat = match config.agent.heartbeat_interval_ms {
        0 => None,
        ms => Some(tokio::spawn(heartbeat(client.clone(), Duration::from_millis(ms)))),
    };

    shutdown_signal().await;

    if let Some(task) = heartbeat {
        task.abort();
    }
    let transition = client.close().await;
    factory.release();
    info!(state = ?transition.current, "agent stopped");
    Ok(())
}

/// Fire-and-forget heartbeat while the connection is up.
async fn heartbeat(client: Client, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        if !client.connection().is_running() {
            continue;
        }
        seq += 1;
        let payload = Bytes::from(format!("heartbeat {}", seq));
        if let Err(e) = client.send(payload).await {
            debug!(error = %e, "heartbeat not sent");
        }
    }
}
