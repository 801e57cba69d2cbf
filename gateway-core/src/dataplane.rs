//! The `DataPlane` façade (§9 "Global mutable state"). Replaces the
//! teacher's module-scope statics (`REDIRECT_RULES`, etc.) with a single
//! value constructed once and threaded explicitly into the request
//! pipeline and every background loop. Tests substitute a `FakeConfigStore`
//! through the same constructor real callers use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::watch;

use crate::config_store::ConfigStore;
use crate::filters::FilterEngine;
use crate::health::{Health, HealthChecker};
use crate::logsink::{BufferedLogSink, LogSinkConfig};
use crate::pipeline::RequestPipeline;
use crate::ratelimit::{HostLimit, RateLimiter};
use crate::routing::RoutingCache;
use crate::selector::BackendSelector;

const ROUTING_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const FILTER_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const RATE_LIMIT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Owns every shared component of the data plane and exposes the
/// administrative refresh calls named in §6. Construct once per process.
pub struct DataPlane {
    store: Arc<dyn ConfigStore>,
    routing: Arc<RoutingCache>,
    filters: Arc<FilterEngine>,
    rate_limiter: Arc<RateLimiter>,
    selector: Arc<BackendSelector>,
    health: Arc<HealthChecker>,
    log_sink: Arc<BufferedLogSink>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DataPlane {
    pub fn new(store: Arc<dyn ConfigStore>, log_sink_config: LogSinkConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            routing: Arc::new(RoutingCache::new()),
            filters: Arc::new(FilterEngine::new()),
            rate_limiter: Arc::new(RateLimiter::new(Duration::from_secs(60))),
            selector: Arc::new(BackendSelector::new()),
            health: Arc::new(HealthChecker::new()),
            log_sink: Arc::new(BufferedLogSink::new(store.clone(), log_sink_config)),
            store,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Builds the `ProxyHttp` implementation pingora drives for each
    /// connection, sharing this data plane's components.
    pub fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(
            self.routing.clone(),
            self.filters.clone(),
            self.rate_limiter.clone(),
            self.selector.clone(),
            self.log_sink.clone(),
        )
    }

    /// §6 `RefreshRouting()`: reload host/backend cache, reset selection
    /// counters and the rate-limiter's per-host config in lockstep, since
    /// both live on the same host rule row.
    pub fn refresh_routing(&self) {
        if let Err(e) = self.routing.refresh(self.store.as_ref()) {
            error!("routing refresh failed, keeping previous snapshot: {e}");
            return;
        }
        self.selector.reset_epoch();
        self.refresh_rate_limits();
    }

    /// §6 `RefreshFilters()`.
    pub fn refresh_filters(&self) {
        if let Err(e) = self.filters.refresh(self.store.as_ref()) {
            error!("filter refresh failed, keeping previous snapshot: {e}");
        }
    }

    /// §6 `RefreshRateLimits()`.
    pub fn refresh_rate_limits(&self) {
        match self.store.load_host_rules() {
            Ok(rules) => {
                let limits: HashMap<String, HostLimit> = rules
                    .iter()
                    .map(|r| (r.host.clone(), HostLimit::from_host_rule(r)))
                    .collect();
                self.rate_limiter.set_limits(limits);
            }
            Err(e) => error!("rate-limit config refresh failed: {e}"),
        }
    }

    pub fn health_snapshot(&self) -> HashMap<String, Health> {
        self.health.snapshot()
    }

    /// Signals every background loop and performs the shutdown sequence
    /// from §5: stop new loops' ticks, flush the sink once more, then
    /// return once the sink has drained.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawns every background loop (routing/filter/rate-limit refresh,
    /// rate-limit sweep, health checker, retention sweeper, log flush) and
    /// runs the initial synchronous population before returning.
    pub async fn run_background_loops(self: &Arc<Self>) {
        self.refresh_routing();
        self.refresh_filters();

        if let Err(e) = crate::retention::sweep_once(self.store.as_ref()) {
            error!("initial retention sweep failed: {e}");
        }
        if let Err(e) = crate::retention::gc_orphan_backends_once(self.store.as_ref()) {
            error!("initial orphan backend gc failed: {e}");
        }

        tokio::spawn(self.clone().routing_refresh_loop());
        tokio::spawn(self.clone().filter_refresh_loop());
        tokio::spawn(self.clone().rate_limit_sweep_loop());
        tokio::spawn(self.clone().health_check_loop());
        tokio::spawn(self.clone().retention_sweep_loop());
        tokio::spawn(self.log_sink.clone().run(self.shutdown_rx.clone()));
    }

    async fn routing_refresh_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(ROUTING_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_routing(),
                _ = shutdown.changed() => if *shutdown.borrow() { return },
            }
        }
    }

    async fn filter_refresh_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(FILTER_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_filters(),
                _ = shutdown.changed() => if *shutdown.borrow() { return },
            }
        }
    }

    async fn rate_limit_sweep_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(RATE_LIMIT_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.rate_limiter.sweep(),
                _ = shutdown.changed() => if *shutdown.borrow() { return },
            }
        }
    }

    async fn health_check_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.load_host_rules() {
                        Ok(rules) => self.health.sweep(&rules).await,
                        Err(e) => error!("health checker could not load host rules: {e}"),
                    }
                }
                _ = shutdown.changed() => if *shutdown.borrow() { return },
            }
        }
    }

    async fn retention_sweep_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = crate::retention::sweep_once(self.store.as_ref()) {
                        error!("retention sweep failed: {e}");
                    } else {
                        info!("retention sweep completed");
                    }
                    if let Err(e) = crate::retention::gc_orphan_backends_once(self.store.as_ref()) {
                        error!("orphan backend gc failed: {e}");
                    }
                }
                _ = shutdown.changed() => if *shutdown.borrow() { return },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::FakeConfigStore;
    use crate::model::{Backend, HostRule};

    fn host_rule() -> HostRule {
        HostRule {
            id: 1,
            host: "api.test".into(),
            rate_limit_enabled: true,
            rate_limit_quota: 5,
            rate_limit_period_seconds: 60,
            log_retention_days: 30,
            health_check_enabled: false,
            backends: vec![Backend { id: 1, url: "http://127.0.0.1:9001".into(), weight: 1, active: true }],
        }
    }

    #[test]
    fn refresh_routing_populates_rate_limiter_too() {
        let store = Arc::new(FakeConfigStore::new());
        store.set_host_rules(vec![host_rule()]);
        let plane = DataPlane::new(store, LogSinkConfig::default());

        plane.refresh_routing();
        assert!(plane.routing.lookup("api.test").is_some());

        for _ in 0..5 {
            assert!(matches!(plane.rate_limiter.check("1.2.3.4", "api.test"), crate::ratelimit::Verdict::Pass));
        }
        assert!(matches!(plane.rate_limiter.check("1.2.3.4", "api.test"), crate::ratelimit::Verdict::Rejected));
    }

    #[test]
    fn refresh_routing_resets_selection_epoch() {
        let store = Arc::new(FakeConfigStore::new());
        store.set_host_rules(vec![host_rule()]);
        let plane = DataPlane::new(store, LogSinkConfig::default());
        plane.refresh_routing();

        let rule = plane.routing.lookup("api.test").unwrap();
        let eligible = rule.eligible_backends();
        plane.selector.select(&eligible);

        plane.refresh_routing();
        assert_eq!(plane.selector.count_for("http://127.0.0.1:9001"), 0);
    }
}
