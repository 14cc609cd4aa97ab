// ABOUTME: Connection state machine shared by the agent and collector ends.
// ABOUTME: Maps handshake, close and transport events onto exactly one terminal state.

use serde::Serialize;

use crate::error::RpcError;

/// Which end of the channel a state machine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    /// Agent side; initiates the connection and the handshake.
    Client,
    /// Collector side; accepts connections.
    Server,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Observable state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Created, nothing attempted yet.
    Ready,
    /// Transport connect or handshake in progress.
    Connecting,
    /// Never reached `RunDuplex`. Terminal.
    ConnectFailed,
    /// Handshake done; traffic flows both ways.
    RunDuplex,
    /// The client role closed gracefully. Terminal.
    ClosedByClient,
    /// The server role closed gracefully. Terminal.
    ClosedByServer,
    /// The client role's transport went away without a close frame. Terminal.
    UnexpectedCloseByClient,
    /// The server role's transport went away without a close frame. Terminal.
    UnexpectedCloseByServer,
    /// Released before ever connecting. Terminal.
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ConnectionState::Ready | ConnectionState::Connecting | ConnectionState::RunDuplex
        )
    }

    pub fn is_running(self) -> bool {
        self == ConnectionState::RunDuplex
    }

    fn closed_by(role: Role) -> Self {
        match role {
            Role::Client => ConnectionState::ClosedByClient,
            Role::Server => ConnectionState::ClosedByServer,
        }
    }

    fn unexpected_close_by(role: Role) -> Self {
        match role {
            Role::Client => ConnectionState::UnexpectedCloseByClient,
            Role::Server => ConnectionState::UnexpectedCloseByServer,
        }
    }
}

/// Which side's transport detected or caused a break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakOrigin {
    /// This side tore the transport down without a graceful close.
    Local,
    /// The peer reset, hit EOF without a close frame, or went silent.
    Peer,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    ConnectStarted,
    HandshakeSucceeded,
    HandshakeFailed,
    LocalClose,
    PeerGracefulClose,
    TransportBroken(BreakOrigin),
}

/// Result of offering an event to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub accepted: bool,
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

impl Transition {
    /// True when this transition is the one that reached a terminal state.
    pub fn entered_terminal(&self) -> bool {
        self.accepted && self.current.is_terminal()
    }

    /// Turn a rejected transition into an `IllegalTransition` error.
    pub fn into_result(self, event: StateEvent) -> Result<ConnectionState, RpcError> {
        if self.accepted {
            Ok(self.current)
        } else {
            Err(RpcError::IllegalTransition {
                from: self.previous,
                event,
            })
        }
    }
}

/// Single enumerated state per connection instance.
///
/// Transitions only move toward a terminal state; once terminal, every
/// further event is rejected and the state is left unchanged.
#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    state: ConnectionState,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: ConnectionState::Ready,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current(&self) -> ConnectionState {
        self.state
    }

    pub fn transition(&mut self, event: StateEvent) -> Transition {
        let previous = self.state;
        match next_state(self.role, previous, event) {
            Some(next) => {
                self.state = next;
                tracing::debug!(
                    role = ?self.role,
                    from = ?previous,
                    to = ?next,
                    event = ?event,
                    "state transition"
                );
                Transition {
                    accepted: true,
                    previous,
                    current: next,
                }
            }
            None => {
                tracing::debug!(
                    role = ?self.role,
                    state = ?previous,
                    event = ?event,
                    "state transition rejected"
                );
                Transition {
                    accepted: false,
                    previous,
                    current: previous,
                }
            }
        }
    }
}

fn next_state(role: Role, state: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use StateEvent::*;

    if state.is_terminal() {
        return None;
    }

    match (state, event) {
        (Ready, ConnectStarted) => Some(Connecting),
        (Ready | Connecting, HandshakeSucceeded) => Some(RunDuplex),
        (Ready | Connecting, HandshakeFailed | TransportBroken(_) | PeerGracefulClose) => {
            Some(ConnectFailed)
        }
        (Ready | Connecting, LocalClose) => Some(Closed),
        (RunDuplex, LocalClose) => Some(ConnectionState::closed_by(role)),
        (RunDuplex, PeerGracefulClose) => Some(ConnectionState::closed_by(role.peer())),
        (RunDuplex, TransportBroken(BreakOrigin::Local)) => {
            Some(ConnectionState::unexpected_close_by(role))
        }
        (RunDuplex, TransportBroken(BreakOrigin::Peer)) => {
            Some(ConnectionState::unexpected_close_by(role.peer()))
        }
        _ => None,
    }
}
