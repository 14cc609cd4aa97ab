// ABOUTME: Duplex RPC channel between monitored agents and a collector.
// ABOUTME: Connection state machine, correlator, dispatcher, reconnecting client and acceptor.

pub mod acceptor;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod reconnect;
pub mod registration;
pub mod state;
pub mod transport;

mod sync;

// Collector side
pub use acceptor::{Acceptor, RegistryEvent};

// Agent side
pub use client::{Client, ClientFactory, ClientFactoryBuilder};
pub use reconnect::{ReconnectSupervisor, SupervisorState};

// Configuration
pub use config::{
    default_server_id, ClientOptions, ConnectionOptions, KeepAliveConfig, RetryPolicy,
    ServerOptions, DEFAULT_MAX_CONCURRENT_HANDLERS, DEFAULT_WRITE_BUFFER,
    MIN_TIMEOUT_CHECK_INTERVAL,
};

// Connection and its parts
pub use connection::Connection;
pub use correlator::{Correlator, ResponseFuture, ResponseResult};
pub use dispatcher::CommandDispatcher;
pub use state::{BreakOrigin, ConnectionState, Role, StateEvent, StateMachine, Transition};
pub use transport::{split_framed, CloseCause, FrameHandler, FrameSender, Transport};

// Handlers
pub use handler::{
    handler_fn, CommandHandler, DefaultListener, FnHandler, MessageListener, RequestContext,
};

// Identity
pub use registration::{AgentIdentity, ConnectionId, Registration, MAX_ID_LENGTH};

// Error types
pub use error::{HandlerError, RpcError};

// Re-export wire types for convenience
pub use beacon_proto;
