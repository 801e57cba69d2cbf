//! Routing cache (§4.2): a lock-free snapshot of host rules keyed by host,
//! refreshed periodically from the config store. Reads never block a
//! refresh in progress, the same property the teacher reaches for with
//! `static REDIRECT_RULES: LazyLock<RwLock<...>>` in
//! `router-core/src/app/gateway.rs`, but implemented with `ArcSwap` so a
//! lookup never takes a lock at all.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::warn;

use crate::config_store::ConfigStore;
use crate::model::HostRule;

/// Immutable snapshot installed atomically on each refresh.
struct Snapshot {
    by_host: HashMap<String, Arc<HostRule>>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            by_host: HashMap::new(),
        }
    }
}

/// O(1) lookups by host, O(1) atomic pointer swap on refresh. A failed
/// refresh leaves the previous snapshot in place (§4.2 Failure semantics).
pub struct RoutingCache {
    snapshot: ArcSwap<Snapshot>,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
        }
    }

    /// Reloads every host rule from the store and installs a fresh snapshot.
    /// On error, the existing snapshot is retained and the error is returned
    /// for the caller to log.
    pub fn refresh(&self, store: &dyn ConfigStore) -> Result<(), crate::error::DatabaseError> {
        let rules = store.load_host_rules()?;
        let mut by_host = HashMap::with_capacity(rules.len());
        for rule in rules {
            by_host.insert(rule.host.clone(), Arc::new(rule));
        }
        self.snapshot.store(Arc::new(Snapshot { by_host }));
        Ok(())
    }

    /// Looks up the host rule for an exact `Host` header value. Case-folds
    /// to lowercase, per the glossary's normalization of `Host`/`client_ip`.
    pub fn lookup(&self, host: &str) -> Option<Arc<HostRule>> {
        let host = host.to_ascii_lowercase();
        self.snapshot.load().by_host.get(&host).cloned()
    }
}

impl Default for RoutingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs and swallows a refresh failure, matching the background-loop
/// logging style carried through the rest of the data plane.
pub fn refresh_logging_errors(cache: &RoutingCache, store: &dyn ConfigStore) {
    if let Err(e) = cache.refresh(store) {
        warn!("routing cache refresh failed, keeping previous snapshot: {e}");
    }
}
