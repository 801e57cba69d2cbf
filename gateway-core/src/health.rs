//! Health checker (§4.6). Probes every backend referenced by a host rule
//! with `health_check_enabled=true`, fanning requests out concurrently with
//! `futures::future::join_all` and folding the results into a process-local
//! status map. Informational only: selection does not consult it (§9).

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use log::debug;
use parking_lot::RwLock;
use reqwest::Client;

use crate::model::HostRule;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

pub struct HealthChecker {
    client: Client,
    status: RwLock<HashMap<String, Health>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("reqwest client with only a timeout configured should always build");
        Self {
            client,
            status: RwLock::new(HashMap::new()),
        }
    }

    /// Status as of the last completed sweep. `None` means the URL has
    /// never been probed (not yet referenced, or evicted).
    pub fn status_of(&self, url: &str) -> Option<Health> {
        self.status.read().get(url).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, Health> {
        self.status.read().clone()
    }

    /// One probe sweep over every URL referenced by an active, health-check-
    /// enabled host rule. URLs no longer in that set are evicted.
    pub async fn sweep(&self, host_rules: &[HostRule]) {
        let mut urls: Vec<String> = Vec::new();
        for rule in host_rules {
            if !rule.health_check_enabled {
                continue;
            }
            for backend in rule.eligible_backends() {
                urls.push(backend.url.clone());
            }
        }
        urls.sort();
        urls.dedup();

        let probes = urls.iter().map(|url| self.probe_one(url));
        let results = join_all(probes).await;

        let mut status = self.status.write();
        status.clear();
        for (url, health) in urls.into_iter().zip(results) {
            status.insert(url, health);
        }
    }

    async fn probe_one(&self, url: &str) -> Health {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let code = resp.status().as_u16();
                if (200..500).contains(&code) {
                    Health::Healthy
                } else {
                    Health::Unhealthy
                }
            }
            Err(e) => {
                debug!("health probe failed for {url}: {e}");
                Health::Unhealthy
            }
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Backend;

    fn rule(enabled: bool, urls: &[&str]) -> HostRule {
        HostRule {
            id: 1,
            host: "example.com".into(),
            rate_limit_enabled: false,
            rate_limit_quota: 0,
            rate_limit_period_seconds: 60,
            log_retention_days: 30,
            health_check_enabled: enabled,
            backends: urls
                .iter()
                .enumerate()
                .map(|(i, u)| Backend { id: i as i64, url: u.to_string(), weight: 1, active: true })
                .collect(),
        }
    }

    #[tokio::test]
    async fn disabled_rule_contributes_no_urls() {
        let checker = HealthChecker::new();
        checker.sweep(&[rule(false, &["http://127.0.0.1:1"])]).await;
        assert!(checker.status_of("http://127.0.0.1:1").is_none());
    }

    #[tokio::test]
    async fn unreachable_backend_is_unhealthy() {
        let checker = HealthChecker::new();
        checker.sweep(&[rule(true, &["http://127.0.0.1:1"])]).await;
        assert_eq!(checker.status_of("http://127.0.0.1:1"), Some(Health::Unhealthy));
    }

    #[tokio::test]
    async fn eviction_drops_urls_no_longer_probed() {
        let checker = HealthChecker::new();
        checker.sweep(&[rule(true, &["http://127.0.0.1:1"])]).await;
        assert!(checker.status_of("http://127.0.0.1:1").is_some());
        checker.sweep(&[rule(true, &["http://127.0.0.1:2"])]).await;
        assert!(checker.status_of("http://127.0.0.1:1").is_none());
    }
}
