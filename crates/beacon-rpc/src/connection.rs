// ABOUTME: One logical duplex connection: state machine, transport, correlator and handlers.
// ABOUTME: Routes inbound frames, exposes send/request/command, and attributes every termination.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use beacon_proto::{frame::Body, CodecError, Frame};
use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{ConnectionOptions, MIN_TIMEOUT_CHECK_INTERVAL};
use crate::correlator::{Correlator, ResponseFuture, ResponseResult};
use crate::dispatcher::{run_guarded, CommandDispatcher, HandlerPool};
use crate::error::RpcError;
use crate::handler::{MessageListener, RequestContext};
use crate::registration::{AgentIdentity, ConnectionId, Registration};
use crate::state::{ConnectionState, Role, StateEvent, StateMachine, Transition};
use crate::sync::lock;
use crate::transport::{CloseCause, FrameHandler, Transport};

/// What the handshake established about the two ends.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub agent: AgentIdentity,
    pub server_id: String,
    /// Present on the collector side.
    pub registration: Option<Registration>,
}

struct ConnectionInner {
    id: ConnectionId,
    role: Role,
    machine: Mutex<StateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    options: ConnectionOptions,
    correlator: Correlator,
    dispatcher: Arc<CommandDispatcher>,
    listener: Arc<dyn MessageListener>,
    pool: HandlerPool,
    session: OnceLock<Session>,
    context: OnceLock<RequestContext>,
    transport: OnceLock<Transport>,
    last_inbound: Mutex<Instant>,
    ping_seq: AtomicU32,
}

/// Handle to one connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.current_state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        role: Role,
        options: ConnectionOptions,
        dispatcher: Arc<CommandDispatcher>,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Ready);
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                role,
                machine: Mutex::new(StateMachine::new(role)),
                state_tx,
                correlator: Correlator::new(options.request_timeout),
                pool: HandlerPool::new(options.max_concurrent_handlers),
                options,
                dispatcher,
                listener,
                session: OnceLock::new(),
                context: OnceLock::new(),
                transport: OnceLock::new(),
                last_inbound: Mutex::new(Instant::now()),
                ping_seq: AtomicU32::new(0),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn current_state(&self) -> ConnectionState {
        lock(&self.inner.machine).current()
    }

    pub fn is_running(&self) -> bool {
        self.current_state().is_running()
    }

    /// Watch channel that sees every accepted transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until `predicate` holds, up to `timeout`.
    ///
    /// Returns the matching state, or None on timeout.
    pub async fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> Option<ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.subscribe_state();
        let wait = async move { rx.wait_for(|s| predicate(*s)).await.map(|s| *s).ok() };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Wait for the terminal state.
    pub async fn wait_for_terminal(&self) -> ConnectionState {
        let mut rx = self.subscribe_state();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| self.current_state())
    }

    /// Agent identity; known from the start on the agent side, after the handshake on the collector.
    pub fn agent(&self) -> Option<&AgentIdentity> {
        self.inner.session.get().map(|s| &s.agent)
    }

    /// Collector-side registration, once the handshake succeeded.
    pub fn registration(&self) -> Option<&Registration> {
        self.inner
            .session
            .get()
            .and_then(|s| s.registration.as_ref())
    }

    pub fn server_id(&self) -> Option<&str> {
        self.inner.session.get().map(|s| s.server_id.as_str())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Fire-and-forget payload to the peer's listener.
    pub async fn send(&self, payload: Bytes) -> Result<(), RpcError> {
        let transport = self.running_transport()?;
        self.queue(transport, Frame::send(payload)).await
    }

    /// Send a request and wait for its response or the request timeout.
    pub async fn request(&self, payload: Bytes) -> Result<Bytes, RpcError> {
        self.request_future(payload).await?.await
    }

    /// Queue a request and return its pending response without waiting.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn request_future(&self, payload: Bytes) -> Result<ResponseFuture, RpcError> {
        let transport = self.running_transport()?;
        let (request_id, response) = self.inner.correlator.register()?;
        self.queue(transport, Frame::request(request_id, payload))
            .await?;
        Ok(response)
    }

    /// Queue a request and invoke `callback` with its outcome.
    ///
    /// Returns the request id.
    pub async fn request_with_callback<F>(&self, payload: Bytes, callback: F) -> Result<u32, RpcError>
    where
        F: FnOnce(ResponseResult) + Send + 'static,
    {
        let response = self.request_future(payload).await?;
        let request_id = response.request_id();
        tokio::spawn(async move {
            callback(response.await);
        });
        Ok(request_id)
    }

    /// Ask the peer to run a command handler and wait for its result.
    pub async fn send_command(
        &self,
        command_type: &str,
        payload: Bytes,
    ) -> Result<Bytes, RpcError> {
        let transport = self.running_transport()?;
        let (request_id, response) = self.inner.correlator.register()?;
        self.queue(transport, Frame::command(request_id, command_type, payload))
            .await?;
        response.await
    }

    /// Close gracefully: transition first, then tell the peer and shut the transport.
    pub async fn close(&self) -> Transition {
        let transition = self.apply(StateEvent::LocalClose);
        if !transition.accepted {
            tracing::debug!(
                connection_id = %self.inner.id,
                state = ?transition.current,
                "close on terminal connection ignored"
            );
            return transition;
        }
        if let Some(transport) = self.inner.transport.get() {
            if transition.previous.is_running() {
                if let Err(e) = transport.send(self.close_frame("closed")).await {
                    tracing::debug!(connection_id = %self.inner.id, error = %e, "close frame not sent");
                }
            }
            transport.close_locally(CloseCause::Graceful);
        }
        transition
    }

    /// Tear the transport down without a close frame.
    ///
    /// Before a transport exists this is a plain local close.
    pub fn abort(&self) {
        match self.inner.transport.get() {
            Some(transport) => transport.close_locally(CloseCause::LocalAbort),
            None => {
                self.apply(StateEvent::LocalClose);
            }
        }
    }

    /// Resolves once the transport has shut down and reported its cause.
    pub(crate) async fn transport_closed(&self) {
        if let Some(transport) = self.inner.transport.get() {
            transport.closed().await;
        }
    }

    pub(crate) fn begin(&self) -> Transition {
        self.apply(StateEvent::ConnectStarted)
    }

    /// Record a failure before the transport was handed over.
    pub(crate) fn fail(&self, event: StateEvent) -> Transition {
        self.apply(event)
    }

    /// Hand the framed stream to a transport and enter `RunDuplex`.
    ///
    /// If the connection was closed while the handshake was in flight, the
    /// peer is told and the transport shut down.
    pub(crate) fn establish<R, W>(
        &self,
        reader: R,
        writer: W,
        session: Session,
    ) -> Result<ConnectionState, RpcError>
    where
        R: Stream<Item = Result<Frame, CodecError>> + Send + Unpin + 'static,
        W: Sink<Frame, Error = CodecError> + Send + Unpin + 'static,
    {
        let context = RequestContext::new(
            self.inner.id,
            self.inner.role,
            session.agent.clone(),
            session.server_id.clone(),
        );
        let _ = self.inner.context.set(context);
        let _ = self.inner.session.set(session);
        *lock(&self.inner.last_inbound) = Instant::now();

        let handler: Arc<dyn FrameHandler> = self.inner.clone();
        let transport = Transport::start(
            reader,
            writer,
            handler,
            self.inner.options.write_buffer,
            self.inner.options.close_linger,
        );
        let _ = self.inner.transport.set(transport.clone());

        let transition = self.apply(StateEvent::HandshakeSucceeded);
        if !transition.accepted {
            let _ = transport.try_send(self.close_frame("released during handshake"));
            transport.close_locally(CloseCause::Graceful);
        }
        let state = transition.into_result(StateEvent::HandshakeSucceeded)?;

        tokio::spawn(self.clone().housekeeping(transport));
        Ok(state)
    }

    fn apply(&self, event: StateEvent) -> Transition {
        self.inner.apply(event)
    }

    fn running_transport(&self) -> Result<&Transport, RpcError> {
        let state = self.current_state();
        match self.inner.transport.get() {
            Some(transport) if state.is_running() => Ok(transport),
            _ => Err(RpcError::NotConnected(state)),
        }
    }

    async fn queue(&self, transport: &Transport, frame: Frame) -> Result<(), RpcError> {
        transport.send(frame).await.map_err(|e| {
            if self.current_state().is_terminal() {
                RpcError::ConnectionTerminated
            } else {
                e
            }
        })
    }

    fn close_frame(&self, reason: &str) -> Frame {
        match self.inner.role {
            Role::Client => Frame::client_close(reason),
            Role::Server => Frame::server_close(reason),
        }
    }

    /// Request sweep and keep-alive for one running connection.
    async fn housekeeping(self, transport: Transport) {
        let options = &self.inner.options;
        let period = options
            .timeout_check_interval
            .max(MIN_TIMEOUT_CHECK_INTERVAL);
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_ping = Instant::now();

        loop {
            tick.tick().await;
            if self.current_state().is_terminal() {
                break;
            }

            self.inner.correlator.sweep_expired();

            let Some(keep_alive) = &options.keep_alive else {
                continue;
            };
            let now = Instant::now();
            let silent_for = now.duration_since(*lock(&self.inner.last_inbound));
            if silent_for >= keep_alive.timeout {
                tracing::warn!(
                    connection_id = %self.inner.id,
                    silent_ms = silent_for.as_millis() as u64,
                    "peer silent past keep-alive timeout"
                );
                transport.close_locally(CloseCause::PeerTimeout);
                break;
            }
            if self.inner.role == Role::Client
                && now.duration_since(last_ping) >= keep_alive.interval
            {
                last_ping = now;
                let seq = self.inner.ping_seq.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = transport.try_send(Frame::ping(seq)) {
                    tracing::debug!(connection_id = %self.inner.id, error = %e, "ping not queued");
                }
            }
        }
    }
}

impl ConnectionInner {
    fn on_terminal(&self, transition: Transition) {
        let drained = self.correlator.drain();
        tracing::info!(
            connection_id = %self.id,
            role = ?self.role,
            from = ?transition.previous,
            state = ?transition.current,
            drained,
            "connection terminated"
        );
    }

    /// Transitions and their watch publication are serialized under the
    /// machine lock; terminal side effects run after it is released.
    fn apply(&self, event: StateEvent) -> Transition {
        let transition = {
            let mut machine = lock(&self.machine);
            let transition = machine.transition(event);
            if transition.accepted {
                self.state_tx.send_replace(transition.current);
            }
            transition
        };
        if transition.entered_terminal() {
            self.on_terminal(transition);
        }
        transition
    }

    fn is_from_peer(&self, body: &Body) -> bool {
        matches!(
            (self.role, body),
            (Role::Client, Body::ServerClose(_)) | (Role::Server, Body::ClientClose(_))
        )
    }

    fn handle_close_frame(&self, transport: &Transport, body: Body) {
        if !self.is_from_peer(&body) {
            tracing::warn!(
                connection_id = %self.id,
                role = ?self.role,
                "close frame from the wrong role ignored"
            );
            return;
        }
        let reason = match body {
            Body::ClientClose(close) | Body::ServerClose(close) => close.reason,
            _ => String::new(),
        };
        let transition = self.apply(StateEvent::PeerGracefulClose);
        if transition.accepted {
            tracing::debug!(connection_id = %self.id, reason = %reason, "peer closed gracefully");
        }
        transport.close_locally(CloseCause::Graceful);
    }
}

impl FrameHandler for ConnectionInner {
    fn on_frame(&self, transport: &Transport, frame: Frame) {
        *lock(&self.last_inbound) = Instant::now();

        let Some(body) = frame.body else {
            tracing::debug!(connection_id = %self.id, "empty frame ignored");
            return;
        };
        let Some(context) = self.context.get().cloned() else {
            tracing::warn!(connection_id = %self.id, "frame before session setup dropped");
            return;
        };

        match body {
            Body::Response(response) => {
                let result = match response.error {
                    Some(err) => Err(RpcError::from(err)),
                    None => Ok(response.payload),
                };
                self.correlator.complete(response.request_id, result);
            }
            Body::Command(command) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let transport = transport.clone();
                self.pool.spawn(async move {
                    let reply = dispatcher.dispatch(context, command).await;
                    if let Err(e) = transport.send(reply).await {
                        tracing::debug!(error = %e, "command response not sent");
                    }
                });
            }
            Body::Request(request) => {
                let listener = Arc::clone(&self.listener);
                let transport = transport.clone();
                let request_id = request.request_id;
                self.pool.spawn(async move {
                    let ctx = context.for_request(request_id);
                    let reply = match run_guarded(listener.handle_request(ctx, request.payload)).await
                    {
                        Ok(payload) => Frame::response_ok(request_id, payload),
                        Err(err) => Frame::response_err(request_id, err.code, err.message),
                    };
                    if let Err(e) = transport.send(reply).await {
                        tracing::debug!(request_id, error = %e, "response not sent");
                    }
                });
            }
            Body::Send(message) => {
                let listener = Arc::clone(&self.listener);
                self.pool.spawn(async move {
                    listener.handle_send(context, message.payload).await;
                });
            }
            Body::Ping(ping) => {
                if let Err(e) = transport.try_send(Frame::pong(ping.id)) {
                    tracing::debug!(connection_id = %self.id, error = %e, "pong not queued");
                }
            }
            Body::Pong(_) => {}
            body @ (Body::ClientClose(_) | Body::ServerClose(_)) => {
                self.handle_close_frame(transport, body);
            }
            Body::Handshake(_) | Body::HandshakeResponse(_) => {
                tracing::warn!(connection_id = %self.id, "handshake frame after handshake ignored");
            }
        }
    }

    fn on_closed(&self, cause: CloseCause) {
        let event = match cause.origin() {
            Some(origin) => StateEvent::TransportBroken(origin),
            None => StateEvent::PeerGracefulClose,
        };
        let transition = self.apply(event);
        if !transition.accepted {
            tracing::debug!(
                connection_id = %self.id,
                cause = ?cause,
                state = ?transition.current,
                "transport closed after terminal state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepAliveConfig;
    use crate::error::HandlerError;
    use crate::handler::{handler_fn, DefaultListener};
    use crate::transport::split_framed;
    use async_trait::async_trait;
    use beacon_proto::ErrorCode;

    struct EchoListener {
        sends: tokio::sync::mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl MessageListener for EchoListener {
        async fn handle_send(&self, _ctx: RequestContext, payload: Bytes) {
            let _ = self.sends.send(payload);
        }

        async fn handle_request(
            &self,
            _ctx: RequestContext,
            payload: Bytes,
        ) -> Result<Bytes, HandlerError> {
            if &payload[..] == b"slow" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(payload)
        }
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions::default()
            .with_request_timeout(Duration::from_millis(300))
            .with_timeout_check_interval(Duration::from_millis(20))
            .with_close_linger(Duration::from_millis(200))
    }

    fn session() -> Session {
        Session {
            agent: AgentIdentity::new("app", "agent-1", 1),
            server_id: "collector-1".to_string(),
            registration: None,
        }
    }

    struct Pair {
        client: Connection,
        server: Connection,
        server_sends: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    }

    fn pair_with(client_opts: ConnectionOptions, server_opts: ConnectionOptions) -> Pair {
        let (a, b) = tokio::io::duplex(256 * 1024);

        let mut dispatcher = CommandDispatcher::new();
        dispatcher
            .register(
                "echo",
                handler_fn(|_ctx: RequestContext, payload: Bytes| async move { Ok(payload) }),
            )
            .unwrap();
        let client = Connection::new(
            Role::Client,
            client_opts,
            Arc::new(dispatcher),
            Arc::new(DefaultListener),
        );

        let (tx, server_sends) = tokio::sync::mpsc::unbounded_channel();
        let server = Connection::new(
            Role::Server,
            server_opts,
            Arc::new(CommandDispatcher::new()),
            Arc::new(EchoListener { sends: tx }),
        );

        client.begin();
        server.begin();
        let (r, w) = split_framed(a, 1024 * 1024);
        client.establish(r, w, session()).unwrap();
        let (r, w) = split_framed(b, 1024 * 1024);
        server.establish(r, w, session()).unwrap();

        Pair {
            client,
            server,
            server_sends,
        }
    }

    fn pair() -> Pair {
        pair_with(options(), options())
    }

    async fn terminal(conn: &Connection) -> ConnectionState {
        conn.wait_for_state(ConnectionState::is_terminal, Duration::from_secs(3))
            .await
            .expect("connection did not terminate")
    }

    #[tokio::test]
    async fn test_established_pair_is_running() {
        let p = pair();
        assert_eq!(p.client.current_state(), ConnectionState::RunDuplex);
        assert_eq!(p.server.current_state(), ConnectionState::RunDuplex);
        assert_eq!(p.client.server_id(), Some("collector-1"));
        assert_eq!(p.client.agent().unwrap().agent_id, "agent-1");
        assert!(p.client.registration().is_none());
    }

    #[tokio::test]
    async fn test_request_response() {
        let p = pair();
        let reply = p.client.request(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(&reply[..], b"hello");
        assert_eq!(p.client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let p = pair();
        let mut handles = Vec::new();
        for i in 0..32u32 {
            let client = p.client.clone();
            handles.push(tokio::spawn(async move {
                let body = Bytes::from(i.to_string());
                let reply = client.request(body.clone()).await.unwrap();
                assert_eq!(reply, body);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_reaches_listener() {
        let mut p = pair();
        p.client.send(Bytes::from_static(b"metrics")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), p.server_sends.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"metrics");
    }

    #[tokio::test]
    async fn test_command_runs_on_agent() {
        let p = pair();
        let reply = p
            .server
            .send_command("echo", Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"ping");
    }

    #[tokio::test]
    async fn test_unknown_command_returns_unsupported() {
        let p = pair();
        let err = p
            .server
            .send_command("thread-dump", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedCommand(_)));
        assert!(p.server.is_running());
    }

    #[tokio::test]
    async fn test_request_to_default_listener_is_unsupported() {
        let p = pair();
        let err = p.server.request(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Remote {
                code: ErrorCode::Unsupported,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_request_times_out_without_affecting_connection() {
        let p = pair();
        let err = p.client.request(Bytes::from_static(b"slow")).await.unwrap_err();
        assert!(matches!(err, RpcError::ResponseTimeout { .. }));
        assert!(p.client.is_running());

        let reply = p.client.request(Bytes::from_static(b"fast")).await.unwrap();
        assert_eq!(&reply[..], b"fast");
    }

    #[tokio::test]
    async fn test_zero_check_interval_still_times_out_requests() {
        let mut zero = options();
        zero.timeout_check_interval = Duration::ZERO;
        let p = pair_with(zero.clone(), zero);

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            p.client.request(Bytes::from_static(b"slow")),
        )
        .await
        .expect("request outlived its timeout");
        assert!(matches!(outcome, Err(RpcError::ResponseTimeout { .. })));
        assert!(p.client.is_running());
    }

    #[tokio::test]
    async fn test_client_close_attribution() {
        let p = pair();
        let t = p.client.close().await;
        assert!(t.accepted);
        assert_eq!(t.current, ConnectionState::ClosedByClient);
        assert_eq!(terminal(&p.server).await, ConnectionState::ClosedByClient);

        // Second close is rejected and leaves the state alone.
        assert!(!p.client.close().await.accepted);
        assert_eq!(p.client.current_state(), ConnectionState::ClosedByClient);
    }

    #[tokio::test]
    async fn test_server_close_attribution() {
        let p = pair();
        assert_eq!(p.server.close().await.current, ConnectionState::ClosedByServer);
        assert_eq!(terminal(&p.client).await, ConnectionState::ClosedByServer);
    }

    #[tokio::test]
    async fn test_client_abort_attribution() {
        let p = pair();
        p.client.abort();
        assert_eq!(terminal(&p.client).await, ConnectionState::UnexpectedCloseByClient);
        assert_eq!(terminal(&p.server).await, ConnectionState::UnexpectedCloseByClient);
    }

    #[tokio::test]
    async fn test_server_abort_attribution() {
        let p = pair();
        p.server.abort();
        assert_eq!(terminal(&p.server).await, ConnectionState::UnexpectedCloseByServer);
        assert_eq!(terminal(&p.client).await, ConnectionState::UnexpectedCloseByServer);
    }

    #[tokio::test]
    async fn test_pending_requests_drained_on_termination() {
        let p = pair();
        let pending = p
            .client
            .request_future(Bytes::from_static(b"slow"))
            .await
            .unwrap();
        p.client.abort();
        assert!(matches!(pending.await, Err(RpcError::ConnectionTerminated)));
        assert!(matches!(
            p.client.request(Bytes::new()).await,
            Err(RpcError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_request_with_callback() {
        let p = pair();
        let (tx, rx) = tokio::sync::oneshot::channel();
        p.client
            .request_with_callback(Bytes::from_static(b"cb"), move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();
        let payload = rx.await.unwrap().unwrap();
        assert_eq!(&payload[..], b"cb");
    }

    #[tokio::test]
    async fn test_silent_peer_hits_keep_alive_timeout() {
        let client_opts = options().without_keep_alive();
        let server_opts = options().with_keep_alive(KeepAliveConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(250),
        });
        let p = pair_with(client_opts, server_opts);

        assert_eq!(terminal(&p.server).await, ConnectionState::UnexpectedCloseByClient);
        assert_eq!(terminal(&p.client).await, ConnectionState::UnexpectedCloseByServer);
    }

    #[tokio::test]
    async fn test_pings_keep_connection_alive() {
        let ka = KeepAliveConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(300),
        };
        let p = pair_with(
            options().with_keep_alive(ka.clone()),
            options().with_keep_alive(ka),
        );
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(p.client.is_running());
        assert!(p.server.is_running());
    }

    #[tokio::test]
    async fn test_close_before_connect_is_closed() {
        let conn = Connection::new(
            Role::Client,
            options(),
            Arc::new(CommandDispatcher::new()),
            Arc::new(DefaultListener),
        );
        assert_eq!(conn.current_state(), ConnectionState::Ready);
        assert_eq!(conn.close().await.current, ConnectionState::Closed);
        assert!(matches!(
            conn.send(Bytes::new()).await,
            Err(RpcError::NotConnected(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_establish_after_release_is_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let conn = Connection::new(
            Role::Client,
            options(),
            Arc::new(CommandDispatcher::new()),
            Arc::new(DefaultListener),
        );
        conn.begin();
        conn.abort();
        assert_eq!(conn.current_state(), ConnectionState::Closed);

        let (r, w) = split_framed(a, 1024);
        let err = conn.establish(r, w, session()).unwrap_err();
        assert!(matches!(err, RpcError::IllegalTransition { .. }));

        // The peer is told the agent went away.
        use futures::StreamExt;
        let (mut peer_reader, _peer_writer) = split_framed(b, 1024);
        let frame = peer_reader.next().await.unwrap().unwrap();
        assert_eq!(frame.kind(), "client_close");
    }
}
