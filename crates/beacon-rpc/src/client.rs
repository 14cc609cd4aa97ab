// ABOUTME: Agent-side client factory: connects, handshakes and keeps connections alive.
// ABOUTME: Each client pairs a current connection with a reconnect supervisor.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use beacon_proto::{frame::Body, Frame, HandshakeCode, HandshakeResponse};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::ClientOptions;
use crate::connection::{Connection, Session};
use crate::correlator::ResponseFuture;
use crate::dispatcher::CommandDispatcher;
use crate::error::RpcError;
use crate::handler::{CommandHandler, DefaultListener, MessageListener};
use crate::reconnect::{ReconnectSupervisor, SupervisorState};
use crate::registration::AgentIdentity;
use crate::state::{BreakOrigin, ConnectionState, Role, StateEvent, Transition};
use crate::sync::lock;
use crate::transport::{split_framed, FrameReader, FrameWriter};

/// Builder for [`ClientFactory`].
pub struct ClientFactoryBuilder {
    identity: AgentIdentity,
    options: ClientOptions,
    dispatcher: CommandDispatcher,
    listener: Arc<dyn MessageListener>,
    error: Option<RpcError>,
}

impl ClientFactoryBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a command handler advertised to the collector.
    ///
    /// A duplicate command type is reported by [`build`](Self::build).
    pub fn register_command_handler<H>(mut self, command_type: impl Into<String>, handler: H) -> Self
    where
        H: CommandHandler,
    {
        if let Err(e) = self.dispatcher.register(command_type, handler) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Listener for sends and requests initiated by the collector.
    pub fn message_listener<L>(mut self, listener: L) -> Self
    where
        L: MessageListener,
    {
        self.listener = Arc::new(listener);
        self
    }

    pub fn build(self) -> Result<ClientFactory, RpcError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.identity.validate()?;
        Ok(ClientFactory {
            inner: Arc::new(FactoryInner {
                identity: self.identity,
                options: self.options,
                dispatcher: Arc::new(self.dispatcher),
                listener: self.listener,
                registry: Mutex::new(FactoryRegistry {
                    released: false,
                    clients: Vec::new(),
                }),
            }),
        })
    }
}

struct FactoryRegistry {
    released: bool,
    clients: Vec<Weak<ClientShared>>,
}

struct FactoryInner {
    identity: AgentIdentity,
    options: ClientOptions,
    dispatcher: Arc<CommandDispatcher>,
    listener: Arc<dyn MessageListener>,
    registry: Mutex<FactoryRegistry>,
}

/// Creates agent connections to a collector.
///
/// All clients created by one factory share its identity, handlers and
/// options. [`release`](Self::release) shuts every one of them down.
#[derive(Clone)]
pub struct ClientFactory {
    inner: Arc<FactoryInner>,
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("identity", &self.inner.identity)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ClientFactory {
    pub fn builder(identity: AgentIdentity) -> ClientFactoryBuilder {
        ClientFactoryBuilder {
            identity,
            options: ClientOptions::default(),
            dispatcher: CommandDispatcher::new(),
            listener: Arc::new(DefaultListener),
            error: None,
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    pub fn supported_commands(&self) -> Vec<String> {
        self.inner.dispatcher.supported_commands()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.inner.registry).released
    }

    /// Start connecting to `addr` in the background and return at once.
    ///
    /// Failed attempts and unexpected closes are retried per the retry policy.
    pub fn connect(&self, addr: impl Into<String>) -> Client {
        let client = self.new_client(addr.into());
        if client.shared.supervisor.is_released() {
            return client;
        }

        let factory = Arc::clone(&self.inner);
        let shared = Arc::clone(&client.shared);
        tokio::spawn(async move {
            let connection = shared.connection();
            if shared.supervisor.begin_attempt() {
                let result = factory.establish(&connection, &shared.addr).await;
                if let Err(e) = &result {
                    tracing::warn!(addr = %shared.addr, error = %e, "initial connect failed");
                }
                if !shared.supervisor.finish_attempt(result.is_ok()) {
                    connection.abort();
                    return;
                }
            }
            supervise(factory, shared, connection).await;
        });
        client
    }

    /// Connect and handshake before returning.
    ///
    /// On failure nothing is retried; once connected, later unexpected
    /// closes are retried like [`connect`](Self::connect).
    pub async fn connect_and_wait(&self, addr: impl Into<String>) -> Result<Client, RpcError> {
        let client = self.new_client(addr.into());
        let shared = Arc::clone(&client.shared);
        if !shared.supervisor.begin_attempt() {
            return Err(RpcError::Released);
        }

        let connection = shared.connection();
        if let Err(e) = self.inner.establish(&connection, &shared.addr).await {
            shared.supervisor.release();
            return Err(e);
        }
        if !shared.supervisor.finish_attempt(true) {
            connection.abort();
            return Err(RpcError::Released);
        }

        tokio::spawn(supervise(Arc::clone(&self.inner), shared, connection));
        Ok(client)
    }

    /// Stop every supervisor and tear down every live transport locally.
    ///
    /// Idempotent. Connections that were running end in
    /// `UnexpectedCloseByClient`; none are re-established.
    pub fn release(&self) {
        let clients: Vec<Arc<ClientShared>> = {
            let mut registry = lock(&self.inner.registry);
            if registry.released {
                return;
            }
            registry.released = true;
            registry.clients.drain(..).filter_map(|w| w.upgrade()).collect()
        };

        tracing::info!(clients = clients.len(), "releasing client factory");
        for client in clients {
            client.supervisor.release();
            client.connection().abort();
        }
    }

    fn new_client(&self, addr: String) -> Client {
        let connection = self.inner.new_connection();
        let (connection_tx, _) = watch::channel(connection);
        let shared = Arc::new(ClientShared {
            addr,
            connection_tx,
            supervisor: ReconnectSupervisor::new(self.inner.options.reconnect.clone()),
        });

        let mut registry = lock(&self.inner.registry);
        if registry.released {
            shared.supervisor.release();
            shared.connection().abort();
        } else {
            registry.clients.retain(|w| w.strong_count() > 0);
            registry.clients.push(Arc::downgrade(&shared));
        }
        Client { shared }
    }
}

impl FactoryInner {
    fn new_connection(&self) -> Connection {
        Connection::new(
            Role::Client,
            self.options.connection.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.listener),
        )
    }

    /// TCP connect, handshake, and hand over to the connection's transport.
    async fn establish(&self, connection: &Connection, addr: &str) -> Result<(), RpcError> {
        connection.begin();

        let stream = match tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                connection.fail(StateEvent::TransportBroken(BreakOrigin::Peer));
                return Err(RpcError::ConnectionFailed(format!("{}: {}", addr, e)));
            }
            Err(_) => {
                connection.fail(StateEvent::TransportBroken(BreakOrigin::Peer));
                return Err(RpcError::ConnectionFailed(format!("{}: connect timed out", addr)));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        if connection.current_state().is_terminal() {
            return Err(RpcError::Released);
        }

        let (mut reader, mut writer) =
            split_framed(stream, self.options.connection.max_frame_length);
        let handshake = self.identity.to_handshake(
            self.dispatcher.supported_commands(),
            &self.options.properties,
        );

        let exchange = exchange_handshake(&mut reader, &mut writer, Frame::handshake(handshake));
        let response = match tokio::time::timeout(self.options.handshake_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                connection.fail(StateEvent::HandshakeFailed);
                return Err(e);
            }
            Err(_) => {
                connection.fail(StateEvent::HandshakeFailed);
                return Err(RpcError::HandshakeFailed("handshake timed out".to_string()));
            }
        };

        let code = HandshakeCode::try_from(response.code).unwrap_or(HandshakeCode::Unspecified);
        if code != HandshakeCode::Success {
            connection.fail(StateEvent::HandshakeFailed);
            return Err(RpcError::HandshakeRejected {
                code,
                reason: response.message,
            });
        }

        let state = connection.establish(
            reader,
            writer,
            Session {
                agent: self.identity.clone(),
                server_id: response.server_id,
                registration: None,
            },
        )?;
        tracing::info!(
            addr = %addr,
            connection_id = %connection.id(),
            server_id = connection.server_id().unwrap_or_default(),
            state = ?state,
            "connected to collector"
        );
        Ok(())
    }
}

async fn exchange_handshake(
    reader: &mut FrameReader<TcpStream>,
    writer: &mut FrameWriter<TcpStream>,
    handshake: Frame,
) -> Result<HandshakeResponse, RpcError> {
    writer
        .send(handshake)
        .await
        .map_err(|e| RpcError::HandshakeFailed(e.to_string()))?;

    match reader.next().await {
        Some(Ok(Frame {
            body: Some(Body::HandshakeResponse(response)),
        })) => Ok(response),
        Some(Ok(frame)) => Err(RpcError::HandshakeFailed(format!(
            "unexpected {} frame during handshake",
            frame.kind()
        ))),
        Some(Err(e)) => Err(RpcError::HandshakeFailed(e.to_string())),
        None => Err(RpcError::HandshakeFailed(
            "collector closed the connection during handshake".to_string(),
        )),
    }
}

/// Watch the current connection and replace it after retryable terminations.
async fn supervise(factory: Arc<FactoryInner>, shared: Arc<ClientShared>, mut connection: Connection) {
    loop {
        let terminal = connection.wait_for_terminal().await;
        let Some(delay) = shared.supervisor.on_terminated(terminal) else {
            tracing::debug!(addr = %shared.addr, state = ?terminal, "not reconnecting");
            return;
        };
        tracing::info!(
            addr = %shared.addr,
            state = ?terminal,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        if !shared.supervisor.wait_then_begin(delay).await {
            return;
        }

        let next = factory.new_connection();
        shared.connection_tx.send_replace(next.clone());
        let result = factory.establish(&next, &shared.addr).await;
        if let Err(e) = &result {
            tracing::warn!(addr = %shared.addr, error = %e, "reconnect attempt failed");
        }
        if !shared.supervisor.finish_attempt(result.is_ok()) {
            next.abort();
            return;
        }
        connection = next;
    }
}

struct ClientShared {
    addr: String,
    connection_tx: watch::Sender<Connection>,
    supervisor: ReconnectSupervisor,
}

impl ClientShared {
    fn connection(&self) -> Connection {
        self.connection_tx.borrow().clone()
    }
}

/// A reconnecting agent connection to one collector address.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.shared.addr)
            .field("connection", &self.connection())
            .field("supervisor", &self.supervisor_state())
            .finish()
    }
}

impl Client {
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// The current connection; replaced on every reconnect.
    pub fn connection(&self) -> Connection {
        self.shared.connection()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.connection().current_state()
    }

    pub fn supervisor_state(&self) -> SupervisorState {
        self.shared.supervisor.state()
    }

    /// Connect attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.shared.supervisor.attempts()
    }

    /// Wait until the current connection, whichever it is, satisfies `predicate`.
    pub async fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> Option<ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut connections = self.shared.connection_tx.subscribe();
        loop {
            let connection = connections.borrow_and_update().clone();
            let mut states = connection.subscribe_state();
            let matched = async {
                states.wait_for(|s| predicate(*s)).await.map(|s| *s).ok()
            };
            tokio::select! {
                state = matched => {
                    if state.is_some() {
                        return state;
                    }
                }
                changed = connections.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), RpcError> {
        self.connection().send(payload).await
    }

    pub async fn request(&self, payload: Bytes) -> Result<Bytes, RpcError> {
        self.connection().request(payload).await
    }

    pub async fn request_future(&self, payload: Bytes) -> Result<ResponseFuture, RpcError> {
        self.connection().request_future(payload).await
    }

    /// Stop reconnecting and close the current connection gracefully.
    pub async fn close(&self) -> Transition {
        self.shared.supervisor.release();
        self.connection().close().await
    }
}
