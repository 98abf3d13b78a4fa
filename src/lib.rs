//! Project Sentinel - Distributed Latency Monitoring Control Plane
//!
//! Assigns IP targets across a fleet of probing agents, ingests their
//! results into the store, maintains per-pair baselines and health state,
//! and turns detected anomalies into evolving alerts and correlated
//! incidents.
//!
//! ## Core Components
//!
//! - **platform**: configuration, telemetry, worker supervision
//! - **operations**: the control-plane operation facade (agent and
//!   operator surfaces)
//! - **workers**: the long-lived background tasks (flush, sweep, assign,
//!   evaluate, alert, correlate, retention)
//!
//! The heavy lifting lives in the member crates: `sentinel-store`,
//! `sentinel-ingest`, `sentinel-fleet`, `sentinel-lifecycle`,
//! `sentinel-assignment`, `sentinel-evaluator`, `sentinel-alerting` and
//! `sentinel-incidents`.

pub mod operations;
pub mod platform;
pub mod workers;

pub use operations::{ControlPlane, FleetOverview, OpError};
pub use platform::{Platform, PlatformConfig, PlatformContext, PlatformRuntime};
