//! Filter engine (§4.3): a priority-ordered list of predicate/action pairs,
//! snapshotted the same way as the routing cache so evaluation never blocks
//! a concurrent refresh.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::warn;

use crate::config_store::ConfigStore;
use crate::model::{ActionKind, FilterRule, MatchKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Pass,
    Filtered {
        rule_id: i64,
        status: u16,
        body: String,
        redirect_url: Option<String>,
        match_kind: MatchKind,
        match_value: String,
        action_kind: ActionKind,
    },
}

/// The fields of an inbound request the filter engine cares about.
pub struct FilterSubject<'a> {
    pub client_ip: &'a str,
    pub path: &'a str,
    pub host: &'a str,
}

pub struct FilterEngine {
    rules: ArcSwap<Vec<FilterRule>>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Rules returned by the store are expected already ordered
    /// priority-desc, id-asc; this reload preserves that order as-is.
    pub fn refresh(&self, store: &dyn ConfigStore) -> Result<(), crate::error::DatabaseError> {
        let rules = store.load_filter_rules()?;
        self.rules.store(Arc::new(rules));
        Ok(())
    }

    pub fn evaluate(&self, subject: &FilterSubject) -> Decision {
        let rules = self.rules.load();
        for rule in rules.iter() {
            if !rule.active {
                continue;
            }
            let matched = match rule.match_kind {
                MatchKind::ClientIp => {
                    pattern_matches(&rule.match_value, subject.client_ip, rule.match_kind)
                }
                MatchKind::Path => pattern_matches(&rule.match_value, subject.path, rule.match_kind),
                MatchKind::Host => pattern_matches(&rule.match_value, subject.host, rule.match_kind),
            };
            if matched {
                return decision_for(rule);
            }
        }
        Decision::Pass
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn decision_for(rule: &FilterRule) -> Decision {
    let (status, body, redirect_url) = match rule.action_kind {
        ActionKind::Redirect => (302, String::new(), Some(rule.action_value.clone())),
        ActionKind::BadRequest => (400, non_empty_or(&rule.action_value, "Bad Request"), None),
        ActionKind::TooMany => (429, non_empty_or(&rule.action_value, "Too Many Requests"), None),
        ActionKind::Custom => (
            if rule.status_code > 0 { rule.status_code } else { 403 },
            non_empty_or(&rule.action_value, "Request Blocked"),
            None,
        ),
    };
    Decision::Filtered {
        rule_id: rule.id,
        status,
        body,
        redirect_url,
        match_kind: rule.match_kind,
        match_value: rule.match_value.clone(),
        action_kind: rule.action_kind,
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Implements the §4.3/§8 pattern semantics for a match value `v` against a
/// subject `s`. CIDR parsing only applies to `client_ip`; the trailing-slash
/// prefix rule only applies to `path`, everything else falls through to
/// substring matching.
fn pattern_matches(v: &str, s: &str, kind: MatchKind) -> bool {
    if kind == MatchKind::ClientIp && v.contains('/') {
        return cidr_matches(v, s);
    }
    if v.contains('*') {
        return wildcard_matches(v, s);
    }
    if kind == MatchKind::Path && v.ends_with('/') {
        return s.starts_with(v);
    }
    s.contains(v)
}

fn wildcard_matches(v: &str, s: &str) -> bool {
    if v == "*" {
        return true;
    }
    if let Some(inner) = v.strip_prefix('*').and_then(|r| r.strip_suffix('*')) {
        if v.len() >= 2 {
            return s.contains(inner);
        }
    }
    if let Some(suffix) = v.strip_prefix('*') {
        return s.ends_with(suffix);
    }
    if let Some(prefix) = v.strip_suffix('*') {
        return s.starts_with(prefix);
    }
    s == v
}

fn cidr_matches(cidr: &str, subject: &str) -> bool {
    let Ok(ip) = subject.parse::<IpAddr>() else {
        return false;
    };
    let Some((base, bits)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(base_ip) = base.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix_len) = bits.parse::<u32>() else {
        return false;
    };

    match (ip, base_ip) {
        (IpAddr::V4(ip), IpAddr::V4(base)) => {
            if prefix_len > 32 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0u32
            } else {
                u32::MAX << (32 - prefix_len)
            };
            (u32::from(ip) & mask) == (u32::from(base) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(base)) => {
            if prefix_len > 128 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - prefix_len)
            };
            (u128::from(ip) & mask) == (u128::from(base) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, kind: MatchKind, value: &str, priority: i64) -> FilterRule {
        FilterRule {
            id,
            name: format!("rule-{id}"),
            match_kind: kind,
            match_value: value.to_string(),
            action_kind: ActionKind::Custom,
            action_value: String::new(),
            status_code: 403,
            active: true,
            priority,
        }
    }

    #[test]
    fn truth_table() {
        assert!(cidr_matches("10.0.0.0/8", "10.1.2.3"));
        assert!(!cidr_matches("10.0.0.0/8", "192.168.1.1"));
        assert!(wildcard_matches("*", "anything"));
        assert!(wildcard_matches("*admin*", "/admin/login"));
        assert!(pattern_matches("/api/", "/api/users", MatchKind::Path));
        assert!(!pattern_matches("/api/", "/apiv2/users", MatchKind::Path));
        assert!(wildcard_matches("*.example.com", "api.example.com"));
        assert!(wildcard_matches("api.*", "api.example.com"));
        assert!(pattern_matches("example", "my.example.org", MatchKind::Host));
    }

    #[test]
    fn trailing_slash_prefix_rule_is_path_only() {
        // A host or client_ip value ending in '/' falls through to substring,
        // since the prefix rule is defined only for match_kind == path.
        assert!(!pattern_matches("api.example.com/", "api.example.com", MatchKind::Host));
        assert!(pattern_matches("/api/", "/api/users", MatchKind::Path));
    }

    #[test]
    fn evaluate_picks_highest_priority_then_lowest_id() {
        let engine = FilterEngine::new();
        let rules = vec![
            rule(2, MatchKind::Path, "*admin*", 10),
            rule(1, MatchKind::Path, "*admin*", 10),
            rule(3, MatchKind::Path, "*", 1),
        ];
        engine.rules.store(Arc::new(rules));
        let subject = FilterSubject {
            client_ip: "198.51.100.1",
            path: "/admin/login",
            host: "api.test",
        };
        match engine.evaluate(&subject) {
            Decision::Filtered { rule_id, .. } => assert_eq!(rule_id, 1),
            Decision::Pass => panic!("expected a match"),
        }
    }

    #[test]
    fn redirect_action_carries_url_and_no_body() {
        let engine = FilterEngine::new();
        engine.rules.store(Arc::new(vec![FilterRule {
            id: 10,
            name: "legacy".into(),
            match_kind: MatchKind::Path,
            match_value: "/legacy*".into(),
            action_kind: ActionKind::Redirect,
            action_value: "https://new.example/legacy".into(),
            status_code: 0,
            active: true,
            priority: 10,
        }]));
        let subject = FilterSubject {
            client_ip: "198.51.100.1",
            path: "/legacy/a",
            host: "api.test",
        };
        match engine.evaluate(&subject) {
            Decision::Filtered { status, redirect_url, .. } => {
                assert_eq!(status, 302);
                assert_eq!(redirect_url.as_deref(), Some("https://new.example/legacy"));
            }
            Decision::Pass => panic!("expected a redirect"),
        }
    }
}
