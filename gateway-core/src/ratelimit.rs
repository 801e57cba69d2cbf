//! Rate limiter (§4.4): per-host fixed-window limiting keyed by client IP,
//! behind a single lock with an O(1) critical section per request, in the
//! same spirit as the teacher's counter-map locks but generalized to a
//! nested per-IP/per-host structure.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::model::HostRule;

#[derive(Clone, Copy)]
struct HostWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

#[derive(Default)]
struct IpState {
    last_seen: Option<Instant>,
    per_host: HashMap<String, HostWindow>,
}

/// Per-host limit parameters the limiter consults on every request. Kept
/// separate from `HostRule` so the limiter can be refreshed independently
/// per §4.4 ("refreshed periodically... and on demand").
#[derive(Debug, Clone, Copy)]
pub struct HostLimit {
    pub enabled: bool,
    pub quota: u32,
    pub period: Duration,
}

impl HostLimit {
    pub fn from_host_rule(rule: &HostRule) -> Self {
        Self {
            enabled: rule.rate_limit_enabled,
            quota: rule.rate_limit_quota,
            period: Duration::from_secs(rule.rate_limit_period_seconds),
        }
    }
}

pub enum Verdict {
    Pass,
    Rejected,
}

struct State {
    by_ip: HashMap<String, IpState>,
    limits: HashMap<String, HostLimit>,
}

pub struct RateLimiter {
    state: Mutex<State>,
    default_period: Duration,
}

impl RateLimiter {
    pub fn new(default_period: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                by_ip: HashMap::new(),
                limits: HashMap::new(),
            }),
            default_period,
        }
    }

    /// Installs the per-host limit configuration wholesale, as produced by a
    /// routing-cache refresh (the rate-limit config lives alongside the host
    /// rule, so refreshes ride together).
    pub fn set_limits(&self, limits: HashMap<String, HostLimit>) {
        self.state.lock().limits = limits;
    }

    /// §4.4 decision algorithm, evaluated at `now` to keep the logic
    /// deterministic and unit-testable without a real clock.
    pub fn check_at(&self, client_ip: &str, host: &str, now: Instant) -> Verdict {
        let mut state = self.state.lock();
        let Some(limit) = state.limits.get(host).copied() else {
            return Verdict::Pass;
        };
        if !limit.enabled {
            return Verdict::Pass;
        }

        let ip_state = state.by_ip.entry(client_ip.to_string()).or_default();
        ip_state.last_seen = Some(now);

        let window = ip_state
            .per_host
            .entry(host.to_string())
            .or_insert(HostWindow {
                count: 0,
                window_start: now,
                last_seen: now,
            });

        window.last_seen = now;
        if now.duration_since(window.window_start) > limit.period {
            window.count = 1;
            window.window_start = now;
            return Verdict::Pass;
        }

        window.count += 1;
        if window.count > limit.quota {
            Verdict::Rejected
        } else {
            Verdict::Pass
        }
    }

    pub fn check(&self, client_ip: &str, host: &str) -> Verdict {
        self.check_at(client_ip, host, Instant::now())
    }

    /// Evicts stale IP and per-host entries (§4.4 Cleanup). Intended to run
    /// on a coarse background tick (≥ 10 minutes).
    pub fn sweep_at(&self, now: Instant) {
        let mut state = self.state.lock();
        let default_period = self.default_period;
        let limits = state.limits.clone_limits();
        state.by_ip.retain(|_, ip_state| {
            ip_state.per_host.retain(|host, window| {
                let period = limits.get(host).map(|l| l.period).unwrap_or(default_period);
                now.duration_since(window.last_seen) < period * 3
            });
            match ip_state.last_seen {
                Some(last) => now.duration_since(last) < default_period * 3,
                None => false,
            }
        });
    }

    pub fn sweep(&self) {
        self.sweep_at(Instant::now())
    }
}

impl State {
    fn clone_limits(&self) -> HashMap<String, HostLimit> {
        self.limits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_when_host_has_no_config() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        matches!(limiter.check("1.2.3.4", "unconfigured.test"), Verdict::Pass);
    }

    #[test]
    fn rejects_after_quota_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let mut limits = HashMap::new();
        limits.insert(
            "api.test".to_string(),
            HostLimit { enabled: true, quota: 5, period: Duration::from_secs(60) },
        );
        limiter.set_limits(limits);

        let now = Instant::now();
        for _ in 0..5 {
            assert!(matches!(
                limiter.check_at("198.51.100.7", "api.test", now),
                Verdict::Pass
            ));
        }
        assert!(matches!(
            limiter.check_at("198.51.100.7", "api.test", now),
            Verdict::Rejected
        ));
    }

    #[test]
    fn resets_after_window_elapses() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let mut limits = HashMap::new();
        limits.insert(
            "api.test".to_string(),
            HostLimit { enabled: true, quota: 1, period: Duration::from_millis(10) },
        );
        limiter.set_limits(limits);

        let t0 = Instant::now();
        assert!(matches!(limiter.check_at("1.1.1.1", "api.test", t0), Verdict::Pass));
        assert!(matches!(limiter.check_at("1.1.1.1", "api.test", t0), Verdict::Rejected));

        let t1 = t0 + Duration::from_millis(20);
        assert!(matches!(limiter.check_at("1.1.1.1", "api.test", t1), Verdict::Pass));
    }
}
