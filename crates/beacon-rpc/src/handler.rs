// ABOUTME: Handler traits for inbound commands, sends and requests.
// ABOUTME: Carries an explicit per-request context instead of ambient state.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::HandlerError;
use crate::registration::{AgentIdentity, ConnectionId};
use crate::state::Role;

/// Context handed to every handler invocation.
///
/// Contains information about the connection and the request being served.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection_id: ConnectionId,
    /// Role of the end running the handler.
    pub role: Role,
    /// The agent on this connection (the local agent on the agent side).
    pub agent: AgentIdentity,
    /// Collector the agent is talking to.
    pub server_id: String,
    /// Correlation id of the request or command; None for sends.
    pub request_id: Option<u32>,
    /// Set when handling a command.
    pub command_type: Option<String>,
}

impl RequestContext {
    pub fn new(connection_id: ConnectionId, role: Role, agent: AgentIdentity, server_id: String) -> Self {
        Self {
            connection_id,
            role,
            agent,
            server_id,
            request_id: None,
            command_type: None,
        }
    }

    pub(crate) fn for_request(&self, request_id: u32) -> Self {
        Self {
            request_id: Some(request_id),
            ..self.clone()
        }
    }

    pub(crate) fn for_command(&self, request_id: u32, command_type: &str) -> Self {
        Self {
            request_id: Some(request_id),
            command_type: Some(command_type.to_string()),
            ..self.clone()
        }
    }
}

/// Executes one collector-initiated command type on the agent.
///
/// Runs on its own task; it may block on I/O or take a while without
/// holding up the connection's read loop.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Bytes, HandlerError>;
}

/// A closure-based command handler. See [`handler_fn`].
pub struct FnHandler<F> {
    callback: F,
}

/// Wrap an async closure as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(callback: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    FnHandler { callback }
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Bytes, HandlerError> {
        (self.callback)(ctx, payload).await
    }
}

/// Receives plain sends and requests from the peer.
///
/// Both methods have defaults: sends are logged and dropped, requests are
/// answered with an `Unsupported` error.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn handle_send(&self, ctx: RequestContext, payload: Bytes) {
        tracing::debug!(
            connection_id = %ctx.connection_id,
            bytes = payload.len(),
            "dropping send with no listener"
        );
    }

    async fn handle_request(
        &self,
        _ctx: RequestContext,
        _payload: Bytes,
    ) -> Result<Bytes, HandlerError> {
        Err(HandlerError::unsupported("requests are not accepted"))
    }
}

/// Listener that accepts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultListener;

impl MessageListener for DefaultListener {}
