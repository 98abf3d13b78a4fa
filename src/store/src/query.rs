//! # Metrics Query Layer
//!
//! Filter model, window parsing and aggregate-level selection for the
//! operator metrics surface. The compiler picks the coarsest pre-aggregated
//! view that still satisfies the requested window and bucket:
//!
//! | window        | source            |
//! |---------------|-------------------|
//! | <= 24h, bucket < 1h | 5-minute    |
//! | <= 7d         | hourly            |
//! | <= 90d        | daily             |
//! | > 90d         | monthly           |

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{AgentId, StoreError, StoreResult, TargetId};

/// Pre-aggregated view granularities over probe results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateLevel {
    FiveMinute,
    Hourly,
    Daily,
    Monthly,
}

impl AggregateLevel {
    pub fn bucket(&self) -> Duration {
        match self {
            AggregateLevel::FiveMinute => Duration::minutes(5),
            AggregateLevel::Hourly => Duration::hours(1),
            AggregateLevel::Daily => Duration::days(1),
            AggregateLevel::Monthly => Duration::days(30),
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            AggregateLevel::FiveMinute => "probe_5min",
            AggregateLevel::Hourly => "probe_hourly",
            AggregateLevel::Daily => "probe_daily",
            AggregateLevel::Monthly => "probe_monthly",
        }
    }
}

/// Comparison operators accepted by tag filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    In,
    NotIn,
    Regex,
}

/// One tag predicate, e.g. `tags["rack"] starts_with "ord-"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFilter {
    pub key: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl TagFilter {
    /// Evaluate against a tag map. A missing key only satisfies the negated
    /// operators.
    pub fn matches(&self, tags: &HashMap<String, String>) -> StoreResult<bool> {
        let value = tags.get(&self.key);
        let first = self.values.first().map(String::as_str).unwrap_or("");
        Ok(match (self.op, value) {
            (FilterOp::Equals, Some(v)) => v == first,
            (FilterOp::NotEquals, Some(v)) => v != first,
            (FilterOp::Contains, Some(v)) => v.contains(first),
            (FilterOp::NotContains, Some(v)) => !v.contains(first),
            (FilterOp::StartsWith, Some(v)) => v.starts_with(first),
            (FilterOp::In, Some(v)) => self.values.iter().any(|x| x == v),
            (FilterOp::NotIn, Some(v)) => !self.values.iter().any(|x| x == v),
            (FilterOp::Regex, Some(v)) => {
                let re = Regex::new(first)
                    .map_err(|e| StoreError::InvalidInput(format!("bad regex: {e}")))?;
                re.is_match(v)
            }
            (FilterOp::NotEquals | FilterOp::NotContains | FilterOp::NotIn, None) => true,
            (_, None) => false,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    pub ids: Vec<AgentId>,
    pub regions: Vec<String>,
    pub providers: Vec<String>,
    pub tag_filters: Vec<TagFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetFilter {
    pub ids: Vec<TargetId>,
    pub tiers: Vec<String>,
    /// Regions resolved through the target's subnet
    pub regions: Vec<String>,
    pub tag_filters: Vec<TagFilter>,
}

/// Either a relative window string (`1h`, `24h`, `7d`, `90d`) or explicit
/// bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", untagged)]
pub enum TimeRange {
    Window(String),
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl TimeRange {
    /// Resolve to concrete bounds against `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> StoreResult<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            TimeRange::Window(spec) => {
                let d = parse_window(spec)?;
                Ok((now - d, now))
            }
            TimeRange::Absolute { start, end } => {
                if end <= start {
                    return Err(StoreError::InvalidInput(
                        "time range end must be after start".to_string(),
                    ));
                }
                Ok((*start, *end))
            }
        }
    }
}

/// Parse a window spec like `90s`, `15m`, `24h`, `7d`.
pub fn parse_window(spec: &str) -> StoreResult<Duration> {
    let spec = spec.trim();
    let split = spec
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| StoreError::InvalidInput(format!("bad window '{spec}'")))?;
    let (num, unit) = spec.split_at(split);
    let n: i64 = num
        .parse()
        .map_err(|_| StoreError::InvalidInput(format!("bad window '{spec}'")))?;
    if n <= 0 {
        return Err(StoreError::InvalidInput(format!("bad window '{spec}'")));
    }
    match unit {
        "s" => Ok(Duration::seconds(n)),
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        _ => Err(StoreError::InvalidInput(format!("bad window '{spec}'"))),
    }
}

/// Metrics computable from the aggregate views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AvgLatency,
    MinLatency,
    MaxLatency,
    P50Latency,
    P95Latency,
    P99Latency,
    Jitter,
    PacketLoss,
    SuccessRate,
    ProbeCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Time,
    Agent,
    AgentRegion,
    AgentProvider,
    Target,
    TargetTier,
    TargetRegion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub agent_filter: AgentFilter,
    #[serde(default)]
    pub target_filter: TargetFilter,
    pub range: TimeRange,
    /// Explicit bucket; auto-selected from the window when absent
    pub bucket: Option<i64>,
    pub metrics: Vec<Metric>,
    pub group_by: Vec<GroupBy>,
}

/// One output row of a compiled metrics query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRow {
    pub bucket_start: DateTime<Utc>,
    /// Group-by dimension values keyed by dimension name
    pub dimensions: HashMap<String, String>,
    pub values: HashMap<Metric, f64>,
}

/// Pick the aggregate source per the window table. An explicit sub-hour
/// bucket keeps short windows on the 5-minute view.
pub fn select_aggregate_level(window: Duration, bucket: Option<Duration>) -> AggregateLevel {
    let sub_hour_bucket = bucket.map(|b| b < Duration::hours(1)).unwrap_or(true);
    if window <= Duration::hours(24) && sub_hour_bucket {
        AggregateLevel::FiveMinute
    } else if window <= Duration::days(7) {
        AggregateLevel::Hourly
    } else if window <= Duration::days(90) {
        AggregateLevel::Daily
    } else {
        AggregateLevel::Monthly
    }
}

/// Auto-select a bucket yielding roughly 100-500 points over the window,
/// never finer than the aggregate level itself.
pub fn auto_bucket(window: Duration, level: AggregateLevel) -> Duration {
    let target_points = 300;
    let raw = window.num_seconds() / target_points;
    let floor = level.bucket().num_seconds();
    Duration::seconds(raw.max(floor))
}
