//! Entities shared by the config store facade, the routing/filter caches,
//! and the log sink. Every type here round-trips through `serde` so the
//! same shape is usable at the persistence boundary and in tests.

use serde::{Deserialize, Serialize};

/// A host rule: the routing and policy unit keyed by request `Host`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRule {
    pub id: i64,
    pub host: String,
    pub rate_limit_enabled: bool,
    pub rate_limit_quota: u32,
    pub rate_limit_period_seconds: u64,
    pub log_retention_days: i64,
    pub health_check_enabled: bool,
    pub backends: Vec<Backend>,
}

impl HostRule {
    /// Backends eligible for selection: `active == true`.
    pub fn eligible_backends(&self) -> Vec<&Backend> {
        self.backends.iter().filter(|b| b.active).collect()
    }
}

/// A concrete origin a host rule may forward to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub id: i64,
    pub url: String,
    pub weight: u32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    ClientIp,
    Path,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Redirect,
    BadRequest,
    TooMany,
    Custom,
}

/// A priority-ordered predicate-plus-action record. `Evaluate` matches
/// these in descending `priority`, ties broken by ascending `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    pub name: String,
    pub match_kind: MatchKind,
    pub match_value: String,
    pub action_kind: ActionKind,
    pub action_value: String,
    pub status_code: u16,
    pub active: bool,
    pub priority: i64,
}

/// One row of the append-only request log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub client_ip: String,
    pub host: String,
    pub path: String,
    pub backend_id: i64,
    pub latency_ms: i64,
    pub status_code: u16,
    pub is_success: bool,
    pub user_agent: String,
    pub filter_id: i64,
}

/// One row of the filter-match log, same semantics as `RequestLogEntry`
/// but scoped to requests a filter rule short-circuited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub client_ip: String,
    pub host: String,
    pub path: String,
    pub user_agent: String,
    pub filter_id: i64,
    pub match_kind: MatchKind,
    pub match_value: String,
    pub action_kind: ActionKind,
    pub status_code: u16,
}

/// A single row from `ListHostsWithRetention`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRetention {
    pub host: String,
    pub retention_days: i64,
}

pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 30;
