// ABOUTME: Option structs for connections, clients and the acceptor.
// ABOUTME: Defaults plus with_* builders; the binary maps its TOML file onto these.

use std::time::Duration;

use beacon_proto::DEFAULT_MAX_FRAME_LENGTH;

/// Default number of frames buffered ahead of the writer task.
pub const DEFAULT_WRITE_BUFFER: usize = 100;

/// Default cap on handler executions in flight per connection.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 8;

/// Shortest period the pending-request sweep runs at.
pub const MIN_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Liveness settings for an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// How often the client role sends a ping.
    pub interval: Duration,
    /// Silence longer than this tears the transport down.
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Settings shared by both roles once a transport exists.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long a request may wait for its response.
    pub request_timeout: Duration,
    /// Period of the pending-request sweep.
    pub timeout_check_interval: Duration,
    /// Keep-alive configuration. If None, liveness is not checked.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Outbound frame queue depth.
    pub write_buffer: usize,
    /// Largest frame accepted or produced.
    pub max_frame_length: usize,
    /// After a graceful close, how long to wait for the peer to hang up.
    pub close_linger: Duration,
    pub max_concurrent_handlers: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            timeout_check_interval: Duration::from_millis(100),
            keep_alive: Some(KeepAliveConfig::default()),
            write_buffer: DEFAULT_WRITE_BUFFER,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            close_linger: Duration::from_secs(1),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

impl ConnectionOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Clamped to `MIN_TIMEOUT_CHECK_INTERVAL`; a zero period would stop the sweep.
    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval.max(MIN_TIMEOUT_CHECK_INTERVAL);
        self
    }

    /// Set custom keep-alive configuration.
    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    /// Disable keep-alive.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    pub fn with_write_buffer(mut self, frames: usize) -> Self {
        self.write_buffer = frames.max(1);
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    pub fn with_close_linger(mut self, linger: Duration) -> Self {
        self.close_linger = linger;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit.max(1);
        self
    }
}

/// Constant-interval reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between a terminal state and the next attempt.
    pub interval: Duration,
    /// Give up after this many consecutive failed attempts. None retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether another attempt is allowed after `failed` consecutive failures.
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }
}

/// Agent-side settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connection: ConnectionOptions,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed for the collector to answer the handshake.
    pub handshake_timeout: Duration,
    pub reconnect: RetryPolicy,
    /// Free-form properties sent with the handshake.
    pub properties: Vec<(String, String)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(3),
            reconnect: RetryPolicy::default(),
            properties: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn with_connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }
}

/// Collector-side settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub connection: ConnectionOptions,
    /// Time allowed for an accepted socket to send its handshake.
    pub handshake_timeout: Duration,
    /// Identifier reported to agents in the handshake response.
    pub server_id: String,
    /// Upper bound on how long `close_all` waits for transports to finish.
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            handshake_timeout: Duration::from_secs(3),
            server_id: default_server_id(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerOptions {
    pub fn with_connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Host name of this machine, or "beacon-collector" if it cannot be read.
pub fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "beacon-collector".to_string())
}
