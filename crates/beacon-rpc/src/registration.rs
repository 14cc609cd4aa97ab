// ABOUTME: Agent identity and the collector-side registration bound to a live connection.
// ABOUTME: Validates identity fields and converts to and from the handshake frame.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use beacon_proto::{Handshake, PROTOCOL_VERSION};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::RpcError;

/// Longest application name or agent id accepted.
pub const MAX_ID_LENGTH: usize = 24;

/// Process-unique identifier of one connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who an agent is: application name, agent id and process start time.
///
/// The triple is unique among live connections on one collector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AgentIdentity {
    pub application_name: String,
    pub agent_id: String,
    /// Agent process start, milliseconds since the Unix epoch.
    pub start_timestamp: i64,
}

impl AgentIdentity {
    pub fn new(
        application_name: impl Into<String>,
        agent_id: impl Into<String>,
        start_timestamp: i64,
    ) -> Self {
        Self {
            application_name: application_name.into(),
            agent_id: agent_id.into(),
            start_timestamp,
        }
    }

    /// Identity stamped with the current time as its start timestamp.
    pub fn starting_now(application_name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::new(application_name, agent_id, Utc::now().timestamp_millis())
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        validate_id("application name", &self.application_name)?;
        validate_id("agent id", &self.agent_id)?;
        if self.start_timestamp < 0 {
            return Err(RpcError::InvalidIdentity(format!(
                "start timestamp {} is negative",
                self.start_timestamp
            )));
        }
        Ok(())
    }

    pub(crate) fn from_handshake(handshake: &Handshake) -> Self {
        Self::new(
            handshake.application_name.clone(),
            handshake.agent_id.clone(),
            handshake.start_timestamp,
        )
    }

    pub(crate) fn to_handshake(
        &self,
        supported_commands: Vec<String>,
        properties: &[(String, String)],
    ) -> Handshake {
        Handshake {
            application_name: self.application_name.clone(),
            agent_id: self.agent_id.clone(),
            start_timestamp: self.start_timestamp,
            protocol_version: PROTOCOL_VERSION,
            supported_commands,
            properties: properties.iter().cloned().collect(),
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.application_name, self.agent_id, self.start_timestamp
        )
    }
}

fn validate_id(field: &str, value: &str) -> Result<(), RpcError> {
    if value.is_empty() || value.len() > MAX_ID_LENGTH {
        return Err(RpcError::InvalidIdentity(format!(
            "{} must be 1-{} characters, got {}",
            field,
            MAX_ID_LENGTH,
            value.len()
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(RpcError::InvalidIdentity(format!(
            "{} contains invalid character {:?}",
            field, bad
        )));
    }
    Ok(())
}

/// An agent identity bound to a live collector-side connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub connection_id: ConnectionId,
    pub identity: AgentIdentity,
    /// Command types the agent advertised in its handshake.
    pub supported_commands: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
}

impl Registration {
    pub(crate) fn from_handshake(
        connection_id: ConnectionId,
        handshake: &Handshake,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let mut supported_commands = handshake.supported_commands.clone();
        supported_commands.sort();
        supported_commands.dedup();
        Self {
            connection_id,
            identity: AgentIdentity::from_handshake(handshake),
            supported_commands,
            properties: handshake
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            remote_addr,
            connected_at: Utc::now(),
        }
    }

    pub fn supports(&self, command_type: &str) -> bool {
        self.supported_commands.iter().any(|c| c == command_type)
    }
}
