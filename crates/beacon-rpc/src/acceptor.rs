// ABOUTME: Collector-side acceptor: accepts agents, runs the handshake, keeps the registry.
// ABOUTME: Publishes registry add/remove events and routes commands to agents by identity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beacon_proto::{frame::Body, Frame, Handshake, HandshakeCode, PROTOCOL_VERSION};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerOptions;
use crate::connection::{Connection, Session};
use crate::dispatcher::CommandDispatcher;
use crate::error::RpcError;
use crate::handler::MessageListener;
use crate::registration::{AgentIdentity, Registration};
use crate::state::{Role, StateEvent};
use crate::transport::{split_framed, FrameReader, FrameWriter};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change to the set of registered agents.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Registration),
    Removed(Registration),
}

/// Agent entry, reserved at handshake time and announced once established
struct RegisteredAgent {
    registration: Registration,
    connection: Connection,
    announced: bool,
}

impl RegisteredAgent {
    fn is_live(&self) -> bool {
        self.announced && self.connection.is_running()
    }
}

struct AcceptorInner {
    options: ServerOptions,
    dispatcher: Arc<CommandDispatcher>,
    listener: Arc<dyn MessageListener>,
    /// Registered agents by identity
    agents: RwLock<HashMap<AgentIdentity, RegisteredAgent>>,
    events: broadcast::Sender<RegistryEvent>,
    shutdown: CancellationToken,
}

/// Accepts agent connections on one TCP listener.
#[derive(Clone)]
pub struct Acceptor {
    tcp: Arc<TcpListener>,
    local_addr: SocketAddr,
    inner: Arc<AcceptorInner>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("server_id", &self.inner.options.server_id)
            .finish()
    }
}

impl Acceptor {
    pub async fn bind<A, L>(addr: A, options: ServerOptions, listener: L) -> Result<Self, RpcError>
    where
        A: ToSocketAddrs,
        L: MessageListener,
    {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        tracing::info!(addr = %local_addr, server_id = %options.server_id, "collector listening");

        Ok(Self {
            tcp: Arc::new(tcp),
            local_addr,
            inner: Arc::new(AcceptorInner {
                options,
                dispatcher: Arc::new(CommandDispatcher::new()),
                listener: Arc::new(listener),
                agents: RwLock::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_id(&self) -> &str {
        &self.inner.options.server_id
    }

    /// Wait for the next agent and run its handshake.
    ///
    /// A rejected handshake is returned as an error; the acceptor itself
    /// stays usable.
    pub async fn accept(&self) -> Result<Connection, RpcError> {
        let (stream, peer) = self.tcp.accept().await?;
        Arc::clone(&self.inner).handshake(stream, Some(peer)).await
    }

    /// Accept in the background until [`close_all`](Self::close_all).
    ///
    /// Each handshake runs on its own task so a slow agent cannot hold up the loop.
    pub fn start(&self) -> JoinHandle<()> {
        let tcp = Arc::clone(&self.tcp);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    accepted = tcp.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            if let Err(e) = inner.handshake(stream, Some(peer)).await {
                                tracing::warn!(peer = %peer, error = %e, "agent handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            tracing::debug!("accept loop stopped");
        })
    }

    /// Registrations of every live agent, oldest first.
    pub async fn list_connections(&self) -> Vec<Registration> {
        let mut registrations: Vec<Registration> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.is_live())
            .map(|a| a.registration.clone())
            .collect();
        registrations.sort_by_key(|r| r.connected_at);
        registrations
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.inner
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.is_live())
            .map(|a| a.connection.clone())
            .collect()
    }

    pub async fn find(&self, identity: &AgentIdentity) -> Option<Connection> {
        self.inner
            .agents
            .read()
            .await
            .get(identity)
            .filter(|a| a.is_live())
            .map(|a| a.connection.clone())
    }

    /// Run a command on the agent with `identity` and wait for its result.
    ///
    /// Commands the agent did not advertise fail locally without touching the wire.
    pub async fn send_command(
        &self,
        identity: &AgentIdentity,
        command_type: &str,
        payload: Bytes,
    ) -> Result<Bytes, RpcError> {
        let connection = {
            let agents = self.inner.agents.read().await;
            let agent = agents
                .get(identity)
                .filter(|a| a.is_live())
                .ok_or_else(|| RpcError::AgentNotFound(identity.to_string()))?;
            if !agent.registration.supports(command_type) {
                return Err(RpcError::UnsupportedCommand(command_type.to_string()));
            }
            agent.connection.clone()
        };
        connection.send_command(command_type, payload).await
    }

    /// Registry add/remove notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Stop accepting and close every live connection gracefully.
    ///
    /// Waits up to the shutdown timeout for the closes to drain; whatever is
    /// still open afterwards is aborted. Returns the number of connections closed.
    pub async fn close_all(&self) -> usize {
        self.inner.shutdown.cancel();
        // Reserved and still-closing entries are included.
        let connections: Vec<Connection> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .map(|a| a.connection.clone())
            .collect();
        if connections.is_empty() {
            return 0;
        }
        tracing::info!(connections = connections.len(), "closing all agent connections");

        let closes = connections.iter().map(|connection| async move {
            connection.close().await;
            connection.wait_for_terminal().await;
            connection.transport_closed().await;
        });
        let drained = tokio::time::timeout(
            self.inner.options.shutdown_timeout,
            futures::future::join_all(closes),
        )
        .await;
        if drained.is_err() {
            tracing::warn!("shutdown timeout elapsed; aborting remaining connections");
            for connection in &connections {
                connection.abort();
            }
        }
        connections.len()
    }
}

impl AcceptorInner {
    async fn handshake(
        self: Arc<Self>,
        stream: TcpStream,
        peer: Option<SocketAddr>,
    ) -> Result<Connection, RpcError> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let connection = Connection::new(
            Role::Server,
            self.options.connection.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.listener),
        );
        connection.begin();

        let (mut reader, mut writer) =
            split_framed(stream, self.options.connection.max_frame_length);

        let handshake = match tokio::time::timeout(
            self.options.handshake_timeout,
            read_handshake(&mut reader),
        )
        .await
        {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(HandshakeReadError::Unexpected(kind))) => {
                let reason = format!("expected handshake, got {}", kind);
                return self
                    .reject(&connection, &mut writer, HandshakeCode::ProtocolError, reason)
                    .await;
            }
            Ok(Err(HandshakeReadError::Failed(e))) => {
                connection.fail(StateEvent::HandshakeFailed);
                return Err(e);
            }
            Err(_) => {
                connection.fail(StateEvent::HandshakeFailed);
                return Err(RpcError::HandshakeFailed("handshake timed out".to_string()));
            }
        };

        if handshake.protocol_version != PROTOCOL_VERSION {
            let reason = format!(
                "protocol version {} not supported (expected {})",
                handshake.protocol_version, PROTOCOL_VERSION
            );
            return self
                .reject(&connection, &mut writer, HandshakeCode::ProtocolError, reason)
                .await;
        }

        let registration = Registration::from_handshake(connection.id(), &handshake, peer);
        let identity = registration.identity.clone();
        if let Err(e) = identity.validate() {
            return self
                .reject(&connection, &mut writer, HandshakeCode::Rejected, e.to_string())
                .await;
        }

        if let Err(code) = self.register(&registration, &connection).await {
            let reason = match code {
                HandshakeCode::DuplicateAgent => format!("agent {} is already connected", identity),
                _ => "collector is shutting down".to_string(),
            };
            return self.reject(&connection, &mut writer, code, reason).await;
        }

        let accepted = Frame::handshake_response(HandshakeCode::Success, "", &self.options.server_id);
        if let Err(e) = writer.send(accepted).await {
            self.unregister(&registration).await;
            connection.fail(StateEvent::HandshakeFailed);
            return Err(RpcError::HandshakeFailed(e.to_string()));
        }

        let session = Session {
            agent: identity.clone(),
            server_id: self.options.server_id.clone(),
            registration: Some(registration.clone()),
        };
        if let Err(e) = connection.establish(reader, writer, session) {
            self.unregister(&registration).await;
            return Err(e);
        }

        if !self.announce(&registration).await {
            connection.abort();
            return Err(RpcError::HandshakeFailed(
                "registration replaced during handshake".to_string(),
            ));
        }
        tracing::info!(
            agent = %identity,
            connection_id = %connection.id(),
            commands = ?registration.supported_commands,
            "agent registered"
        );
        tokio::spawn(Arc::clone(&self).watch(registration, connection.clone()));
        Ok(connection)
    }

    /// Reserve the identity unless another live connection holds it.
    ///
    /// A terminal entry whose watcher has not run yet is replaced, and its
    /// removal is published here so every `Added` is paired with a `Removed`.
    async fn register(
        &self,
        registration: &Registration,
        connection: &Connection,
    ) -> Result<(), HandshakeCode> {
        let mut agents = self.agents.write().await;
        if self.shutdown.is_cancelled() {
            return Err(HandshakeCode::Rejected);
        }
        if let Some(existing) = agents.get(&registration.identity) {
            if !existing.connection.current_state().is_terminal() {
                return Err(HandshakeCode::DuplicateAgent);
            }
        }
        let stale = agents.insert(
            registration.identity.clone(),
            RegisteredAgent {
                registration: registration.clone(),
                connection: connection.clone(),
                announced: false,
            },
        );
        if let Some(stale) = stale.filter(|a| a.announced) {
            tracing::info!(
                agent = %stale.registration.identity,
                connection_id = %stale.registration.connection_id,
                "replacing stale registration"
            );
            let _ = self.events.send(RegistryEvent::Removed(stale.registration));
        }
        Ok(())
    }

    /// Publish an established registration. False if it is no longer in the registry.
    async fn announce(&self, registration: &Registration) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&registration.identity) {
            Some(agent) if agent.registration.connection_id == registration.connection_id => {
                agent.announced = true;
                let _ = self.events.send(RegistryEvent::Added(registration.clone()));
                true
            }
            _ => false,
        }
    }

    /// Remove the agent if the registry still maps it to this connection.
    /// Returns whether a `Removed` event was published.
    async fn unregister(&self, registration: &Registration) -> bool {
        let mut agents = self.agents.write().await;
        let current = agents
            .get(&registration.identity)
            .map(|a| a.registration.connection_id);
        if current != Some(registration.connection_id) {
            return false;
        }
        match agents.remove(&registration.identity) {
            Some(agent) if agent.announced => {
                let _ = self
                    .events
                    .send(RegistryEvent::Removed(agent.registration));
                true
            }
            _ => false,
        }
    }

    async fn watch(self: Arc<Self>, registration: Registration, connection: Connection) {
        let state = connection.wait_for_terminal().await;
        if self.unregister(&registration).await {
            tracing::info!(
                agent = %registration.identity,
                connection_id = %registration.connection_id,
                state = ?state,
                "agent unregistered"
            );
        }
    }

    async fn reject(
        &self,
        connection: &Connection,
        writer: &mut FrameWriter<TcpStream>,
        code: HandshakeCode,
        reason: String,
    ) -> Result<Connection, RpcError> {
        tracing::warn!(connection_id = %connection.id(), code = ?code, reason = %reason, "rejecting handshake");
        let response = Frame::handshake_response(code, reason.clone(), &self.options.server_id);
        if let Err(e) = writer.send(response).await {
            tracing::debug!(error = %e, "handshake rejection not delivered");
        }
        connection.fail(StateEvent::HandshakeFailed);
        Err(RpcError::HandshakeRejected { code, reason })
    }
}

enum HandshakeReadError {
    Unexpected(&'static str),
    Failed(RpcError),
}

async fn read_handshake(reader: &mut FrameReader<TcpStream>) -> Result<Handshake, HandshakeReadError> {
    match reader.next().await {
        Some(Ok(Frame {
            body: Some(Body::Handshake(handshake)),
        })) => Ok(handshake),
        Some(Ok(frame)) => Err(HandshakeReadError::Unexpected(frame.kind())),
        Some(Err(e)) => Err(HandshakeReadError::Failed(RpcError::HandshakeFailed(
            e.to_string(),
        ))),
        None => Err(HandshakeReadError::Failed(RpcError::HandshakeFailed(
            "agent closed the connection during handshake".to_string(),
        ))),
    }
}
