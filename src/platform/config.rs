use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sentinel_assignment::AssignmentConfig;
use sentinel_evaluator::EvaluatorConfig;
use sentinel_fleet::FleetConfig;
use sentinel_incidents::IncidentConfig;
use sentinel_ingest::IngestConfig;
use sentinel_lifecycle::LifecycleConfig;
use sentinel_store::{LivenessThresholds, PgStoreConfig};

const DEFAULT_CONFIG_PATH: &str = "configs/sentinel.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub metadata: MetadataSettings,
    pub observability: ObservabilitySettings,
    pub store: StoreSettings,
    pub ingest: IngestSettings,
    pub fleet: FleetSettings,
    pub lifecycle: LifecycleSettings,
    pub assignment: AssignmentSettings,
    pub evaluator: EvaluatorSettings,
    pub alerting: AlertingSettings,
    pub incidents: IncidentSettings,
    pub cache: CacheSettings,
    pub retention: RetentionSettings,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            metadata: MetadataSettings::default(),
            observability: ObservabilitySettings::default(),
            store: StoreSettings::default(),
            ingest: IngestSettings::default(),
            fleet: FleetSettings::default(),
            lifecycle: LifecycleSettings::default(),
            assignment: AssignmentSettings::default(),
            evaluator: EvaluatorSettings::default(),
            alerting: AlertingSettings::default(),
            incidents: IncidentSettings::default(),
            cache: CacheSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl PlatformConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("SENTINEL").separator("__"));

        let config = builder.build()?;
        config
            .try_deserialize()
            .context("invalid platform configuration")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub name: String,
    pub environment: String,
    pub node: String,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            name: "project-sentinel".to_string(),
            environment: "development".to_string(),
            node: "node-0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: u16,
    pub enable_metrics: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// "memory" for dev bootstrap, "postgres" for production
    pub backend: String,
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let pg = PgStoreConfig::default();
        Self {
            backend: "memory".to_string(),
            url: pg.url,
            max_connections: pg.max_connections,
            acquire_timeout_secs: pg.acquire_timeout_secs,
        }
    }
}

impl StoreSettings {
    pub fn pg_config(&self) -> PgStoreConfig {
        PgStoreConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            acquire_timeout_secs: self.acquire_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub flush_interval_secs: u64,
    pub flush_batch_size: usize,
    pub buffer_capacity: usize,
    pub shutdown_drain_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        let c = IngestConfig::default();
        Self {
            flush_interval_secs: c.flush_interval_secs,
            flush_batch_size: c.flush_batch_size,
            buffer_capacity: c.buffer_capacity,
            shutdown_drain_secs: c.shutdown_drain_secs,
        }
    }
}

impl IngestSettings {
    pub fn to_config(&self) -> IngestConfig {
        IngestConfig {
            flush_interval_secs: self.flush_interval_secs,
            flush_batch_size: self.flush_batch_size,
            buffer_capacity: self.buffer_capacity,
            shutdown_drain_secs: self.shutdown_drain_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub heartbeat_active_secs: i64,
    pub heartbeat_offline_secs: i64,
    pub sweep_interval_secs: u64,
    pub default_max_targets: u32,
}

impl Default for FleetSettings {
    fn default() -> Self {
        let c = FleetConfig::default();
        Self {
            heartbeat_active_secs: c.liveness.active_secs,
            heartbeat_offline_secs: c.liveness.offline_secs,
            sweep_interval_secs: c.sweep_interval_secs,
            default_max_targets: c.default_max_targets,
        }
    }
}

impl FleetSettings {
    pub fn to_config(&self) -> FleetConfig {
        FleetConfig {
            liveness: self.liveness(),
            sweep_interval_secs: self.sweep_interval_secs,
            default_max_targets: self.default_max_targets,
        }
    }

    pub fn liveness(&self) -> LivenessThresholds {
        LivenessThresholds {
            active_secs: self.heartbeat_active_secs,
            offline_secs: self.heartbeat_offline_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub down_after_secs: i64,
    pub unresponsive_after_secs: i64,
    pub exclude_after_secs: i64,
    pub recovery_window_secs: i64,
    pub scan_interval_secs: u64,
    pub election_interval_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        let c = LifecycleConfig::default();
        Self {
            down_after_secs: c.down_after_secs,
            unresponsive_after_secs: c.unresponsive_after_secs,
            exclude_after_secs: c.exclude_after_secs,
            recovery_window_secs: c.recovery_window_secs,
            scan_interval_secs: c.scan_interval_secs,
            election_interval_secs: c.election_interval_secs,
        }
    }
}

impl LifecycleSettings {
    pub fn to_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            down_after_secs: self.down_after_secs,
            unresponsive_after_secs: self.unresponsive_after_secs,
            exclude_after_secs: self.exclude_after_secs,
            recovery_window_secs: self.recovery_window_secs,
            scan_interval_secs: self.scan_interval_secs,
            election_interval_secs: self.election_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentSettings {
    pub run_interval_secs: u64,
    pub discovery_tier: String,
    pub recheck_tier: String,
    pub slow_tier: String,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        let c = AssignmentConfig::default();
        Self {
            run_interval_secs: c.run_interval_secs,
            discovery_tier: c.discovery_tier,
            recheck_tier: c.recheck_tier,
            slow_tier: c.slow_tier,
        }
    }
}

impl AssignmentSettings {
    pub fn to_config(&self) -> AssignmentConfig {
        AssignmentConfig {
            run_interval_secs: self.run_interval_secs,
            discovery_tier: self.discovery_tier.clone(),
            recheck_tier: self.recheck_tier.clone(),
            slow_tier: self.slow_tier.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorSettings {
    pub tick_secs: u64,
    pub window_secs: i64,
    pub recalc_interval_secs: u64,
    pub baseline_window_days: i64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        let c = EvaluatorConfig::default();
        Self {
            tick_secs: c.tick_secs,
            window_secs: c.window_secs,
            recalc_interval_secs: c.recalc_interval_secs,
            baseline_window_days: c.baseline_window_days,
        }
    }
}

impl EvaluatorSettings {
    pub fn to_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            tick_secs: self.tick_secs,
            window_secs: self.window_secs,
            recalc_interval_secs: self.recalc_interval_secs,
            baseline_window_days: self.baseline_window_days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingSettings {
    pub tick_secs: u64,
    pub consensus_min_agents: usize,
    pub critical_loss_pct: f64,
    pub critical_zscore: f64,
}

impl Default for AlertingSettings {
    fn default() -> Self {
        let c = sentinel_alerting::AlertingConfig::default();
        Self {
            tick_secs: c.tick_secs,
            consensus_min_agents: c.consensus_min_agents,
            critical_loss_pct: c.critical_loss_pct,
            critical_zscore: c.critical_zscore,
        }
    }
}

impl AlertingSettings {
    pub fn to_config(&self) -> sentinel_alerting::AlertingConfig {
        sentinel_alerting::AlertingConfig {
            tick_secs: self.tick_secs,
            consensus_min_agents: self.consensus_min_agents,
            critical_loss_pct: self.critical_loss_pct,
            critical_zscore: self.critical_zscore,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentSettings {
    pub tick_secs: u64,
    pub window_secs: i64,
    pub global_agent_threshold: usize,
}

impl Default for IncidentSettings {
    fn default() -> Self {
        let c = IncidentConfig::default();
        Self {
            tick_secs: c.tick_secs,
            window_secs: c.window_secs,
            global_agent_threshold: c.global_agent_threshold,
        }
    }
}

impl IncidentSettings {
    pub fn to_config(&self) -> IncidentConfig {
        IncidentConfig {
            tick_secs: self.tick_secs,
            window_secs: self.window_secs,
            global_agent_threshold: self.global_agent_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// "off", "memory" or "redis"
    pub backend: String,
    pub redis_url: String,
    pub fleet_overview_ttl_secs: u64,
    pub target_list_ttl_secs: u64,
    pub hot_spots_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            fleet_overview_ttl_secs: 30,
            target_list_ttl_secs: 60,
            hot_spots_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub raw_results_days: i64,
    pub activity_log_days: i64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            raw_results_days: 365,
            activity_log_days: 365,
            sweep_interval_secs: 21_600, // four sweeps a day
        }
    }
}
