//! In-memory `ConfigStore` used by unit and scenario tests so the rest of
//! the crate never needs a live SQLite file to exercise its logic (§8).

use parking_lot::Mutex;

use crate::error::DatabaseError;
use crate::model::{FilterLogEntry, FilterRule, HostRetention, HostRule, RequestLogEntry};

use super::ConfigStore;

#[derive(Default)]
struct State {
    host_rules: Vec<HostRule>,
    filter_rules: Vec<FilterRule>,
    request_logs: Vec<RequestLogEntry>,
    filter_logs: Vec<FilterLogEntry>,
}

/// Swap `host_rules`/`filter_rules` between calls to exercise cache refresh
/// behavior; inspect `request_logs`/`filter_logs` to assert on what the
/// pipeline flushed.
#[derive(Default)]
pub struct FakeConfigStore {
    state: Mutex<State>,
}

impl FakeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_host_rules(&self, rules: Vec<HostRule>) {
        self.state.lock().host_rules = rules;
    }

    pub fn set_filter_rules(&self, rules: Vec<FilterRule>) {
        self.state.lock().filter_rules = rules;
    }

    pub fn request_logs(&self) -> Vec<RequestLogEntry> {
        self.state.lock().request_logs.clone()
    }

    pub fn filter_logs(&self) -> Vec<FilterLogEntry> {
        self.state.lock().filter_logs.clone()
    }
}

impl ConfigStore for FakeConfigStore {
    fn load_host_rules(&self) -> Result<Vec<HostRule>, DatabaseError> {
        Ok(self.state.lock().host_rules.clone())
    }

    fn load_filter_rules(&self) -> Result<Vec<FilterRule>, DatabaseError> {
        Ok(self.state.lock().filter_rules.clone())
    }

    fn append_request_logs(&self, entries: &[RequestLogEntry]) -> Result<(), DatabaseError> {
        self.state.lock().request_logs.extend_from_slice(entries);
        Ok(())
    }

    fn append_filter_log(&self, entry: &FilterLogEntry) -> Result<(), DatabaseError> {
        self.state.lock().filter_logs.push(entry.clone());
        Ok(())
    }

    fn delete_logs_older_than(
        &self,
        host: &str,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state.lock();
        let before_req = state.request_logs.len();
        state
            .request_logs
            .retain(|e| !(e.host == host && e.timestamp < cutoff));
        let removed_req = before_req - state.request_logs.len();

        let before_filter = state.filter_logs.len();
        state
            .filter_logs
            .retain(|e| !(e.host == host && e.timestamp < cutoff));
        let removed_filter = before_filter - state.filter_logs.len();

        Ok((removed_req + removed_filter) as u64)
    }

    fn list_hosts_with_retention(&self) -> Result<Vec<HostRetention>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .host_rules
            .iter()
            .map(|r| HostRetention {
                host: r.host.clone(),
                retention_days: r.log_retention_days,
            })
            .collect())
    }

    fn gc_orphan_backends(&self) -> Result<u64, DatabaseError> {
        // `host_rules` embeds its backends directly here, no separate pool or
        // mapping table to orphan against, so there's nothing to sweep.
        Ok(0)
    }
}
