// ABOUTME: Configuration loading for the beacon binary.
// ABOUTME: TOML file with collector, agent, connection and reconnect sections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_rpc::{
    AgentIdentity, ClientOptions, ConnectionOptions, KeepAliveConfig, RetryPolicy, ServerOptions,
    MAX_ID_LENGTH,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADDR: &str = "127.0.0.1:7878";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub collector: CollectorConfig,
    pub agent: AgentConfig,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Address to listen on
    pub listen: String,
    /// Name reported to agents (defaults to the host name)
    pub server_id: Option<String>,
    pub handshake_timeout_ms: u64,
    /// How long close_all waits for connections to drain
    pub shutdown_timeout_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDR.to_string(),
            server_id: None,
            handshake_timeout_ms: 3_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector address to connect to
    pub collector: String,
    pub application_name: String,
    /// Agent id (defaults to the host name)
    pub agent_id: Option<String>,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Interval between fire-and-forget heartbeat sends; 0 disables them
    pub heartbeat_interval_ms: u64,
    /// Extra key/value pairs sent with the handshake
    pub properties: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector: DEFAULT_ADDR.to_string(),
            application_name: "beacon".to_string(),
            agent_id: None,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 3_000,
            heartbeat_interval_ms: 10_000,
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub request_timeout_ms: u64,
    pub timeout_check_interval_ms: u64,
    pub keep_alive: bool,
    pub keep_alive_interval_ms: u64,
    pub keep_alive_timeout_ms: u64,
    /// Outbound frame queue depth
    pub write_buffer: usize,
    pub max_frame_length: usize,
    pub close_linger_ms: u64,
    pub max_concurrent_handlers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let defaults = ConnectionOptions::default();
        let keep_alive = KeepAliveConfig::default();
        Self {
            request_timeout_ms: millis(defaults.request_timeout),
            timeout_check_interval_ms: millis(defaults.timeout_check_interval),
            keep_alive: true,
            keep_alive_interval_ms: millis(keep_alive.interval),
            keep_alive_timeout_ms: millis(keep_alive.timeout),
            write_buffer: defaults.write_buffer,
            max_frame_length: defaults.max_frame_length,
            close_linger_ms: millis(defaults.close_linger),
            max_concurrent_handlers: defaults.max_concurrent_handlers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub interval_ms: u64,
    /// Give up after this many consecutive failed connects; unset retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: millis(RetryPolicy::default().interval),
            max_attempts: None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Host name reduced to the characters and length an agent id allows.
pub fn default_agent_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let id: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_ID_LENGTH)
        .collect();
    if id.is_empty() {
        "agent".to_string()
    } else {
        id
    }
}

impl Config {
    /// Get the XDG config directory for beacon (~/.config/beacon)
    pub fn config_dir() -> PathBuf {
        // Respect XDG_CONFIG_HOME if set, otherwise use ~/.config
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("beacon")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from the XDG config directory; a missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Explicit path if given (it must exist), otherwise the default location.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Self::load(),
        }
    }

    pub fn default_toml() -> String {
        format!(
            r#"# beacon configuration
# Location: ~/.config/beacon/config.toml

[collector]
listen = "{addr}"
# server_id = "collector-1"      # Defaults to the host name
handshake_timeout_ms = 3000
shutdown_timeout_ms = 5000

[agent]
collector = "{addr}"
application_name = "beacon"
# agent_id = "web-01"            # Defaults to the host name
connect_timeout_ms = 5000
handshake_timeout_ms = 3000
heartbeat_interval_ms = 10000    # 0 disables heartbeats

[agent.properties]
# region = "eu-west-1"

[connection]
request_timeout_ms = 3000
timeout_check_interval_ms = 100
keep_alive = true
keep_alive_interval_ms = 10000
keep_alive_timeout_ms = 20000
write_buffer = 100
max_frame_length = 16777216
close_linger_ms = 1000
max_concurrent_handlers = 8

[reconnect]
interval_ms = 3000
# max_attempts = 10              # Unset retries forever
"#,
            addr = DEFAULT_ADDR
        )
    }

    /// Write the default config to `path` unless a file already exists there.
    ///
    /// Returns whether a file was written.
    pub fn init(path: &Path, force: bool) -> Result<bool> {
        if path.exists() && !force {
            return Ok(false);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }
        std::fs::write(path, Self::default_toml())
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(true)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let c = &self.connection;
        let options = ConnectionOptions::default()
            .with_request_timeout(Duration::from_millis(c.request_timeout_ms))
            .with_timeout_check_interval(Duration::from_millis(c.timeout_check_interval_ms))
            .with_write_buffer(c.write_buffer)
            .with_max_frame_length(c.max_frame_length)
            .with_close_linger(Duration::from_millis(c.close_linger_ms))
            .with_max_concurrent_handlers(c.max_concurrent_handlers);
        if c.keep_alive {
            options.with_keep_alive(KeepAliveConfig {
                interval: Duration::from_millis(c.keep_alive_interval_ms),
                timeout: Duration::from_millis(c.keep_alive_timeout_ms),
            })
        } else {
            options.without_keep_alive()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy =
            RetryPolicy::default().with_interval(Duration::from_millis(self.reconnect.interval_ms));
        match self.reconnect.max_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::default()
            .with_connection(self.connection_options())
            .with_connect_timeout(Duration::from_millis(self.agent.connect_timeout_ms))
            .with_handshake_timeout(Duration::from_millis(self.agent.handshake_timeout_ms))
            .with_reconnect(self.retry_policy());
        for (key, value) in &self.agent.properties {
            options = options.with_property(key, value);
        }
        options
    }

    pub fn server_options(&self) -> ServerOptions {
        let mut options = ServerOptions::default()
            .with_connection(self.connection_options())
            .with_handshake_timeout(Duration::from_millis(self.collector.handshake_timeout_ms))
            .with_shutdown_timeout(Duration::from_millis(self.collector.shutdown_timeout_ms));
        if let Some(server_id) = &self.collector.server_id {
            options = options.with_server_id(server_id);
        }
        options
    }

    /// Identity for an agent process that started now.
    pub fn agent_identity(&self) -> AgentIdentity {
        let agent_id = self.agent.agent_id.clone().unwrap_or_else(default_agent_id);
        AgentIdentity::starting_now(&self.agent.application_name, agent_id)
    }
}
