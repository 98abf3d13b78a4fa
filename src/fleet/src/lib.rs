//! # Sentinel Fleet
//!
//! Agent lifecycle and fleet commands: registration with bcrypt-hashed API
//! keys, heartbeats feeding the agent-metrics time series, computed
//! liveness status, and the background sweeper that audits status
//! transitions.

pub mod registry;
pub mod sweeper;
pub mod types;

pub use registry::FleetRegistry;
pub use sweeper::{run_status_sweeper, sweep_once};
pub use types::*;
