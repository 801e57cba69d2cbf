//! Config store facade (§4.1). Everything above this module talks to
//! persisted configuration and logs only through the `ConfigStore` trait,
//! never through `rusqlite` directly, mirroring the role `Database` plays in
//! `router-api/src/module/database.rs`.

mod fake;
mod sqlite;

pub use fake::FakeConfigStore;
pub use sqlite::SqliteConfigStore;

use crate::error::DatabaseError;
use crate::model::{FilterLogEntry, FilterRule, HostRetention, HostRule, RequestLogEntry};

/// Read/write boundary between the data plane and its persisted configuration.
///
/// Implementations must be safe to call from multiple refresh/log-flush
/// threads concurrently; `SqliteConfigStore` does this with a single
/// connection behind a mutex, same as the teacher's `Database`.
pub trait ConfigStore: Send + Sync {
    /// All host rules and their backends, for the routing cache refresh (§4.2).
    fn load_host_rules(&self) -> Result<Vec<HostRule>, DatabaseError>;

    /// All filter rules, for the filter cache refresh (§4.3).
    fn load_filter_rules(&self) -> Result<Vec<FilterRule>, DatabaseError>;

    /// Appends a batch of request log entries in one transaction (§4.8).
    fn append_request_logs(&self, entries: &[RequestLogEntry]) -> Result<(), DatabaseError>;

    /// Appends a single filter-match log entry (§4.8).
    fn append_filter_log(&self, entry: &FilterLogEntry) -> Result<(), DatabaseError>;

    /// Deletes request and filter log rows for `host` older than `cutoff`.
    fn delete_logs_older_than(
        &self,
        host: &str,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Every host with its configured retention window, for the sweeper (§4.9).
    fn list_hosts_with_retention(&self) -> Result<Vec<HostRetention>, DatabaseError>;

    /// Deletes backend rows referenced by no host rule, returning the count
    /// removed. Run on the same cadence as the retention sweeper (§9).
    fn gc_orphan_backends(&self) -> Result<u64, DatabaseError>;
}
