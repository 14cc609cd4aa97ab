// ABOUTME: Error types for the beacon-rpc crate.
// ABOUTME: Connection-level, per-request and handler errors for the duplex channel.

use beacon_proto::{ErrorCode, HandshakeCode, ResponseError};
use thiserror::Error;

use crate::state::{ConnectionState, StateEvent};

/// Errors that can occur on a beacon connection.
#[derive(Error, Debug)]
pub enum RpcError {
    /// TCP connect failed or timed out.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake was malformed, timed out, or the peer went away mid-handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Collector answered the handshake with a non-success code.
    #[error("handshake rejected ({code:?}): {reason}")]
    HandshakeRejected { code: HandshakeCode, reason: String },

    /// No response arrived within the configured request timeout.
    #[error("response timeout for request {request_id}")]
    ResponseTimeout { request_id: u32 },

    /// Peer has no handler for the command type.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Transport broke underneath an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Event attempted on a connection whose state does not accept it.
    #[error("illegal transition: {event:?} in state {from:?}")]
    IllegalTransition {
        from: ConnectionState,
        event: StateEvent,
    },

    /// Connection reached a terminal state while the request was outstanding.
    #[error("connection terminated")]
    ConnectionTerminated,

    /// Operation requires a running connection.
    #[error("not connected (state {0:?})")]
    NotConnected(ConnectionState),

    /// Peer handler reported a failure.
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// Request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// Client factory has been released.
    #[error("client factory released")]
    Released,

    #[error("invalid agent identity: {0}")]
    InvalidIdentity(String),

    /// No live connection for the agent identity.
    #[error("agent not connected: {0}")]
    AgentNotFound(String),

    /// Handler already registered for the command type.
    #[error("duplicate handler for command type '{0}'")]
    DuplicateHandler(String),

    /// Outbound frame queue is closed.
    #[error("stream closed")]
    StreamClosed,
}

impl From<ResponseError> for RpcError {
    fn from(err: ResponseError) -> Self {
        let code = ErrorCode::try_from(err.code).unwrap_or(ErrorCode::Unknown);
        match code {
            ErrorCode::UnsupportedCommand => RpcError::UnsupportedCommand(err.message),
            ErrorCode::Cancelled => RpcError::Cancelled,
            _ => RpcError::Remote {
                code,
                message: err.message,
            },
        }
    }
}

/// Failure reported by a command handler or message listener.
///
/// Travels back to the peer as the error part of a response frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    /// Handler ran and failed.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::HandlerFailed,
            message: message.into(),
        }
    }

    /// Receiver does not accept this kind of message.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Unsupported,
            message: message.into(),
        }
    }

    pub fn unsupported_command(command_type: &str) -> Self {
        Self {
            code: ErrorCode::UnsupportedCommand,
            message: format!("unsupported command: {}", command_type),
        }
    }
}
