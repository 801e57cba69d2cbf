//! Weighted-fair backend selector (§4.5). A single lock guards the
//! selection-count map; the critical section is pure arithmetic, no I/O.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::model::Backend;

pub struct BackendSelector {
    selected_counts: Mutex<HashMap<String, u64>>,
}

impl BackendSelector {
    pub fn new() -> Self {
        Self {
            selected_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Clears all counters, starting a fresh epoch. Called when the routing
    /// cache refreshes so a newly added backend isn't starved by its peers'
    /// accumulated counts.
    pub fn reset_epoch(&self) {
        self.selected_counts.lock().clear();
    }

    /// Current selection count for a backend's origin URL, 0 if never
    /// selected since the last epoch reset.
    pub fn count_for(&self, url: &str) -> u64 {
        *self.selected_counts.lock().get(url).unwrap_or(&0)
    }

    /// `candidates` must be non-empty; panics otherwise, since the request
    /// pipeline only calls this after confirming eligible backends exist.
    pub fn select<'a>(&self, candidates: &'a [&'a Backend]) -> &'a Backend {
        assert!(!candidates.is_empty(), "select called with no eligible backends");
        if candidates.len() == 1 {
            self.bump(&candidates[0].url);
            return candidates[0];
        }

        let w_min = candidates.iter().map(|b| b.weight).min().unwrap_or(1).max(1) as f64;
        let mut counts = self.selected_counts.lock();

        let mut best_idx = 0;
        let mut best_priority = f64::MIN;
        for (idx, backend) in candidates.iter().enumerate() {
            let ratio = backend.weight as f64 / w_min;
            let selected = *counts.get(&backend.url).unwrap_or(&0) as f64;
            let priority = ratio - selected;
            if priority > best_priority {
                best_priority = priority;
                best_idx = idx;
            }
        }

        let chosen = candidates[best_idx];
        *counts.entry(chosen.url.clone()).or_insert(0) += 1;
        chosen
    }

    fn bump(&self, url: &str) {
        *self.selected_counts.lock().entry(url.to_string()).or_insert(0) += 1;
    }
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str, weight: u32) -> Backend {
        Backend { id: 0, url: url.to_string(), weight, active: true }
    }

    #[test]
    fn single_backend_always_selected() {
        let selector = BackendSelector::new();
        let only = backend("http://u1", 1);
        let candidates = [&only];
        for _ in 0..5 {
            assert_eq!(selector.select(&candidates).url, "http://u1");
        }
    }

    #[test]
    fn converges_to_weight_distribution() {
        let selector = BackendSelector::new();
        let u1 = backend("http://u1", 1);
        let u2 = backend("http://u2", 3);
        let candidates = [&u1, &u2];

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for _ in 0..4000 {
            let chosen = selector.select(&candidates);
            *counts.entry(chosen.url.as_str()).or_insert(0) += 1;
        }

        let c1 = *counts.get("http://u1").unwrap_or(&0) as i64;
        let c2 = *counts.get("http://u2").unwrap_or(&0) as i64;
        assert!((c1 - 1000).abs() <= 50, "u1 count {c1} out of bounds");
        assert!((c2 - 3000).abs() <= 50, "u2 count {c2} out of bounds");
    }

    #[test]
    fn reset_epoch_clears_counters() {
        let selector = BackendSelector::new();
        let u1 = backend("http://u1", 1);
        let candidates = [&u1];
        selector.select(&candidates);
        selector.reset_epoch();
        assert_eq!(selector.count_for("http://u1"), 0);
    }
}
