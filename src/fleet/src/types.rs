//! Fleet registry configuration, requests and errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

use sentinel_store::{
    Agent, AgentStatus, Command, LivenessThresholds, ProbeKind, StoreError,
};

/// Fleet registry configuration
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Heartbeat freshness thresholds for computed status
    pub liveness: LivenessThresholds,
    /// Status sweeper interval in seconds
    pub sweep_interval_secs: u64,
    /// Default capacity for agents that register without one
    pub default_max_targets: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessThresholds::default(),
            sweep_interval_secs: 15,
            default_max_targets: 10_000,
        }
    }
}

/// Fleet registry errors
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Registration payload presented by a new agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub region: String,
    pub provider: String,
    pub location: String,
    pub public_ip: Option<Ipv4Addr>,
    pub capabilities: Vec<ProbeKind>,
    pub max_targets: Option<u32>,
    pub version: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Outcome of a successful registration. `api_key` is shown exactly once;
/// only its bcrypt hash is persisted.
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent: Agent,
    pub api_key: String,
}

/// Heartbeat acknowledgement returned to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// True when the agent's observed assignment version is behind
    pub assignment_stale: bool,
    pub assignment_version: u64,
    pub commands: Vec<Command>,
}

/// An agent joined with its computed liveness status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWithStatus {
    #[serde(flatten)]
    pub agent: Agent,
    pub status: AgentStatus,
    pub status_as_of: DateTime<Utc>,
}
