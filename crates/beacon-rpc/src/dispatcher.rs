// ABOUTME: Command dispatch table keyed by command type, plus the bounded handler pool.
// ABOUTME: Turns every command into exactly one response frame, including on panic.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use beacon_proto::{Command, Frame};
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::Semaphore;

use crate::error::{HandlerError, RpcError};
use crate::handler::{CommandHandler, RequestContext};

/// Registered command handlers, resolved by type tag.
#[derive(Default, Clone)]
pub struct CommandDispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("commands", &self.supported_commands())
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Each command type may have one handler.
    pub fn register<H>(&mut self, command_type: impl Into<String>, handler: H) -> Result<(), RpcError>
    where
        H: CommandHandler,
    {
        let command_type = command_type.into();
        if self.handlers.contains_key(&command_type) {
            return Err(RpcError::DuplicateHandler(command_type));
        }
        tracing::debug!(command_type = %command_type, "registered command handler");
        self.handlers.insert(command_type, Arc::new(handler));
        Ok(())
    }

    /// Registered command types, sorted.
    pub fn supported_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.handlers.keys().cloned().collect();
        commands.sort();
        commands
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `command` and build its response frame.
    ///
    /// Unknown types get an `UnsupportedCommand` response; handler errors
    /// and panics get a `HandlerFailed` response.
    pub async fn dispatch(&self, ctx: RequestContext, command: Command) -> Frame {
        let request_id = command.request_id;
        let Some(handler) = self.handlers.get(&command.command_type).cloned() else {
            tracing::debug!(
                request_id,
                command_type = %command.command_type,
                "no handler for command"
            );
            let err = HandlerError::unsupported_command(&command.command_type);
            return Frame::response_err(request_id, err.code, err.message);
        };

        let ctx = ctx.for_command(request_id, &command.command_type);
        match run_guarded(handler.handle(ctx, command.payload)).await {
            Ok(payload) => Frame::response_ok(request_id, payload),
            Err(err) => {
                tracing::warn!(
                    request_id,
                    command_type = %command.command_type,
                    error = %err,
                    "command handler failed"
                );
                Frame::response_err(request_id, err.code, err.message)
            }
        }
    }
}

/// Await a handler future, turning a panic into a `HandlerFailed` error.
pub(crate) async fn run_guarded<F>(fut: F) -> Result<Bytes, HandlerError>
where
    F: Future<Output = Result<Bytes, HandlerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::failed(format!("handler panicked: {}", detail)))
        }
    }
}

/// Runs handler executions off the read loop, at most `limit` at a time.
#[derive(Debug, Clone)]
pub(crate) struct HandlerPool {
    permits: Arc<Semaphore>,
}

impl HandlerPool {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Spawn `task`; it starts once a permit is free.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::registration::{AgentIdentity, ConnectionId};
    use crate::state::Role;
    use beacon_proto::{frame::Body, ErrorCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new(
            ConnectionId::new(),
            Role::Client,
            AgentIdentity::new("app", "agent-1", 1),
            "collector".to_string(),
        )
    }

    fn command(request_id: u32, command_type: &str, payload: &'static [u8]) -> Command {
        Command {
            request_id,
            command_type: command_type.to_string(),
            payload: Bytes::from_static(payload),
        }
    }

    fn echo() -> impl CommandHandler {
        handler_fn(|_ctx: RequestContext, payload: Bytes| async move { Ok(payload) })
    }

    fn unwrap_response(frame: Frame) -> beacon_proto::Response {
        match frame.body {
            Some(Body::Response(resp)) => resp,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher.register("echo", echo()).unwrap();
        let err = dispatcher.register("echo", echo()).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateHandler(t) if t == "echo"));
    }

    #[test]
    fn test_supported_commands_sorted() {
        let mut dispatcher = CommandDispatcher::new();
        assert!(dispatcher.is_empty());
        dispatcher.register("status", echo()).unwrap();
        dispatcher.register("echo", echo()).unwrap();
        assert_eq!(dispatcher.supported_commands(), vec!["echo", "status"]);
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher
            .register(
                "whoami",
                handler_fn(|ctx: RequestContext, _payload: Bytes| async move {
                    assert_eq!(ctx.command_type.as_deref(), Some("whoami"));
                    assert_eq!(ctx.request_id, Some(3));
                    Ok(Bytes::from(ctx.agent.agent_id))
                }),
            )
            .unwrap();

        let resp = unwrap_response(dispatcher.dispatch(ctx(), command(3, "whoami", b"")).await);
        assert_eq!(resp.request_id, 3);
        assert!(resp.error.is_none());
        assert_eq!(&resp.payload[..], b"agent-1");
    }

    #[tokio::test]
    async fn test_unknown_command_is_unsupported() {
        let dispatcher = CommandDispatcher::new();
        let resp = unwrap_response(dispatcher.dispatch(ctx(), command(9, "dump", b"")).await);
        assert_eq!(resp.request_id, 9);
        assert_eq!(resp.error_code(), Some(ErrorCode::UnsupportedCommand));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher
            .register(
                "fail",
                handler_fn(|_ctx: RequestContext, _payload: Bytes| async move {
                    Err(HandlerError::failed("disk full"))
                }),
            )
            .unwrap();
        let resp = unwrap_response(dispatcher.dispatch(ctx(), command(1, "fail", b"")).await);
        assert_eq!(resp.error_code(), Some(ErrorCode::HandlerFailed));
        assert_eq!(resp.error.unwrap().message, "disk full");
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_response() {
        let mut dispatcher = CommandDispatcher::new();
        dispatcher
            .register(
                "boom",
                handler_fn(|_ctx: RequestContext, _payload: Bytes| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(Bytes::new())
                }),
            )
            .unwrap();
        let resp = unwrap_response(dispatcher.dispatch(ctx(), command(2, "boom", b"")).await);
        assert_eq!(resp.error_code(), Some(ErrorCode::HandlerFailed));
        assert!(resp.error.unwrap().message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = HandlerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }
        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
