//! Retention sweeper (§4.9) and the orphan backend GC (§9 "Orphaned
//! backends … are garbage-collected on a timer"). Both run on a daily
//! cadence, immediately once at startup and then every 24 hours.

use chrono::{Duration as ChronoDuration, Utc};
use log::info;

use crate::config_store::ConfigStore;
use crate::model::DEFAULT_LOG_RETENTION_DAYS;

/// Deletes request/filter log rows older than each host's configured
/// retention window. Hosts with `retention_days <= 0` are skipped; an empty
/// host name falls back to the default window.
pub fn sweep_once(store: &dyn ConfigStore) -> Result<(), crate::error::DatabaseError> {
    let hosts = store.list_hosts_with_retention()?;
    let now = Utc::now();
    for entry in hosts {
        let retention_days = if entry.host.trim().is_empty() {
            DEFAULT_LOG_RETENTION_DAYS
        } else if entry.retention_days > 0 {
            entry.retention_days
        } else {
            continue;
        };
        let cutoff = now - ChronoDuration::days(retention_days);
        let deleted = store.delete_logs_older_than(&entry.host, cutoff)?;
        info!(
            "retention sweep: deleted {deleted} log rows for host {} (cutoff {cutoff})",
            entry.host
        );
    }
    Ok(())
}

/// Deletes backend rows left behind once every host rule referencing them
/// (through `host_backend_map`) has been removed.
pub fn gc_orphan_backends_once(store: &dyn ConfigStore) -> Result<(), crate::error::DatabaseError> {
    let deleted = store.gc_orphan_backends()?;
    if deleted > 0 {
        info!("orphan backend gc: deleted {deleted} backend rows with no remaining host mapping");
    }
    Ok(())
}
