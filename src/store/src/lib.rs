//! # Sentinel Store
//!
//! Entity model and durable persistence for the monitoring control plane.
//! The rest of the system only sees the trait objects defined in
//! [`store`]; backends are the in-memory reference implementation and the
//! Postgres production backend.
//!
//! ## Core Components
//!
//! - **types**: the shared entity model (agents, targets, subnets, tiers,
//!   assignments, probe results, baselines, pair states, alerts, incidents,
//!   activity log, commands)
//! - **store**: per-concern persistence contracts and the `Store` umbrella
//! - **memory**: single-lock in-memory backend for tests and dev bootstrap
//! - **postgres**: sqlx/Postgres backend with the full schema
//! - **query**: metrics-query model and aggregate-level selection

pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;
pub mod types;

pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};
pub use query::*;
pub use store::*;
pub use types::*;
