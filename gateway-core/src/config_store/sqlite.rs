//! SQLite-backed `ConfigStore`, grounded on the `Database` wrapper in
//! `router-api/src/module/database.rs`: a single connection behind a mutex,
//! opened once at startup, with the same `execute`/`query`/`transaction`
//! shape carried over as inherent helpers.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::DatabaseError;
use crate::model::{
    ActionKind, Backend, FilterLogEntry, FilterRule, HostRetention, HostRule, MatchKind,
    RequestLogEntry,
};

use super::ConfigStore;

/// Owns the single connection used for both reads (cache refresh) and
/// writes (log flush, retention sweep). SQLite serializes writers anyway;
/// wrapping in a mutex keeps call sites simple, same tradeoff the teacher
/// makes in `Database`.
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConfigStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS host_rules (
                id                          INTEGER PRIMARY KEY,
                host                        TEXT NOT NULL UNIQUE,
                rate_limit_enabled          INTEGER NOT NULL DEFAULT 0,
                rate_limit_quota            INTEGER NOT NULL DEFAULT 0,
                rate_limit_period_seconds   INTEGER NOT NULL DEFAULT 60,
                log_retention_days          INTEGER NOT NULL DEFAULT 30,
                health_check_enabled        INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS backends (
                id      INTEGER PRIMARY KEY,
                url     TEXT NOT NULL UNIQUE,
                weight  INTEGER NOT NULL DEFAULT 1,
                active  INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS host_backend_map (
                host_rule_id INTEGER NOT NULL REFERENCES host_rules(id) ON DELETE CASCADE,
                backend_id   INTEGER NOT NULL REFERENCES backends(id) ON DELETE CASCADE,
                PRIMARY KEY (host_rule_id, backend_id)
            );

            CREATE TABLE IF NOT EXISTS filter_rules (
                id            INTEGER PRIMARY KEY,
                name          TEXT NOT NULL,
                match_kind    TEXT NOT NULL,
                match_value   TEXT NOT NULL,
                action_kind   TEXT NOT NULL,
                action_value  TEXT NOT NULL DEFAULT '',
                status_code   INTEGER NOT NULL DEFAULT 403,
                active        INTEGER NOT NULL DEFAULT 1,
                priority      INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS request_logs (
                id            INTEGER PRIMARY KEY,
                timestamp     TEXT NOT NULL,
                client_ip     TEXT NOT NULL,
                host          TEXT NOT NULL,
                path          TEXT NOT NULL,
                backend_id    INTEGER NOT NULL,
                latency_ms    INTEGER NOT NULL,
                status_code   INTEGER NOT NULL,
                is_success    INTEGER NOT NULL,
                user_agent    TEXT NOT NULL DEFAULT '',
                filter_id     INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS filter_logs (
                id            INTEGER PRIMARY KEY,
                timestamp     TEXT NOT NULL,
                client_ip     TEXT NOT NULL,
                host          TEXT NOT NULL,
                path          TEXT NOT NULL,
                user_agent    TEXT NOT NULL DEFAULT '',
                filter_id     INTEGER NOT NULL,
                match_kind    TEXT NOT NULL,
                match_value   TEXT NOT NULL,
                action_kind   TEXT NOT NULL,
                status_code   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_request_logs_host_ts ON request_logs(host, timestamp);
            CREATE INDEX IF NOT EXISTS idx_filter_logs_host_ts ON filter_logs(host, timestamp);
            CREATE INDEX IF NOT EXISTS idx_host_backend_map_backend ON host_backend_map(backend_id);",
        )?;
        Ok(())
    }
}

fn match_kind_to_str(k: MatchKind) -> &'static str {
    match k {
        MatchKind::ClientIp => "client_ip",
        MatchKind::Path => "path",
        MatchKind::Host => "host",
    }
}

fn match_kind_from_str(s: &str) -> MatchKind {
    match s {
        "client_ip" => MatchKind::ClientIp,
        "path" => MatchKind::Path,
        _ => MatchKind::Host,
    }
}

fn action_kind_to_str(k: ActionKind) -> &'static str {
    match k {
        ActionKind::Redirect => "redirect",
        ActionKind::BadRequest => "bad_request",
        ActionKind::TooMany => "too_many",
        ActionKind::Custom => "custom",
    }
}

fn action_kind_from_str(s: &str) -> ActionKind {
    match s {
        "redirect" => ActionKind::Redirect,
        "bad_request" => ActionKind::BadRequest,
        "too_many" => ActionKind::TooMany,
        _ => ActionKind::Custom,
    }
}

impl ConfigStore for SqliteConfigStore {
    fn load_host_rules(&self) -> Result<Vec<HostRule>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, host, rate_limit_enabled, rate_limit_quota, rate_limit_period_seconds,
                    log_retention_days, health_check_enabled FROM host_rules",
        )?;
        let mut rules: Vec<HostRule> = stmt
            .query_map([], |row| {
                Ok(HostRule {
                    id: row.get(0)?,
                    host: row.get(1)?,
                    rate_limit_enabled: row.get::<_, i64>(2)? != 0,
                    rate_limit_quota: row.get(3)?,
                    rate_limit_period_seconds: row.get::<_, i64>(4)? as u64,
                    log_retention_days: row.get(5)?,
                    health_check_enabled: row.get::<_, i64>(6)? != 0,
                    backends: Vec::new(),
                })
            })?
            .collect::<Result<_, _>>()?;

        let mut backend_stmt = conn.prepare(
            "SELECT b.id, b.url, b.weight, b.active
             FROM backends b
             JOIN host_backend_map m ON m.backend_id = b.id
             WHERE m.host_rule_id = ?1",
        )?;
        for rule in &mut rules {
            let backends = backend_stmt
                .query_map(params![rule.id], |row| {
                    Ok(Backend {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        weight: row.get(2)?,
                        active: row.get::<_, i64>(3)? != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rule.backends = backends;
        }
        Ok(rules)
    }

    fn load_filter_rules(&self) -> Result<Vec<FilterRule>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, match_kind, match_value, action_kind, action_value,
                    status_code, active, priority FROM filter_rules WHERE active = 1
             ORDER BY priority DESC, id ASC",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(FilterRule {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    match_kind: match_kind_from_str(&row.get::<_, String>(2)?),
                    match_value: row.get(3)?,
                    action_kind: action_kind_from_str(&row.get::<_, String>(4)?),
                    action_value: row.get(5)?,
                    status_code: row.get(6)?,
                    active: row.get::<_, i64>(7)? != 0,
                    priority: row.get(8)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rules)
    }

    fn append_request_logs(&self, entries: &[RequestLogEntry]) -> Result<(), DatabaseError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO request_logs
                    (timestamp, client_ip, host, path, backend_id, latency_ms,
                     status_code, is_success, user_agent, filter_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for e in entries {
                stmt.execute(params![
                    e.timestamp.to_rfc3339(),
                    e.client_ip,
                    e.host,
                    e.path,
                    e.backend_id,
                    e.latency_ms,
                    e.status_code,
                    e.is_success as i64,
                    e.user_agent,
                    e.filter_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn append_filter_log(&self, entry: &FilterLogEntry) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO filter_logs
                (timestamp, client_ip, host, path, user_agent, filter_id,
                 match_kind, match_value, action_kind, status_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.timestamp.to_rfc3339(),
                entry.client_ip,
                entry.host,
                entry.path,
                entry.user_agent,
                entry.filter_id,
                match_kind_to_str(entry.match_kind),
                entry.match_value,
                action_kind_to_str(entry.action_kind),
                entry.status_code,
            ],
        )?;
        Ok(())
    }

    fn delete_logs_older_than(
        &self,
        host: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let cutoff_str = cutoff.to_rfc3339();
        let a = tx.execute(
            "DELETE FROM request_logs WHERE host = ?1 AND timestamp < ?2",
            params![host, cutoff_str],
        )?;
        let b = tx.execute(
            "DELETE FROM filter_logs WHERE host = ?1 AND timestamp < ?2",
            params![host, cutoff_str],
        )?;
        tx.commit()?;
        Ok((a + b) as u64)
    }

    fn list_hosts_with_retention(&self) -> Result<Vec<HostRetention>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT host, log_retention_days FROM host_rules")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HostRetention {
                    host: row.get(0)?,
                    retention_days: row.get(1)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn gc_orphan_backends(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM backends WHERE id NOT IN (SELECT backend_id FROM host_backend_map)",
            [],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_LOG_RETENTION_DAYS;

    fn seed(store: &SqliteConfigStore) {
        let conn = store.conn.lock();
        conn.execute(
            "INSERT INTO host_rules (host, rate_limit_enabled, rate_limit_quota,
                rate_limit_period_seconds, log_retention_days, health_check_enabled)
             VALUES ('example.com', 1, 10, 60, 30, 1)",
            [],
        )
        .unwrap();
        let host_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO backends (url, weight, active) VALUES ('http://127.0.0.1:9001', 1, 1)",
            [],
        )
        .unwrap();
        let backend_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO host_backend_map (host_rule_id, backend_id) VALUES (?1, ?2)",
            params![host_id, backend_id],
        )
        .unwrap();
    }

    #[test]
    fn round_trips_host_rules_with_backends() {
        let store = SqliteConfigStore::open(":memory:").unwrap();
        seed(&store);
        let rules = store.load_host_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host, "example.com");
        assert_eq!(rules[0].backends.len(), 1);
        assert_eq!(rules[0].backends[0].url, "http://127.0.0.1:9001");
    }

    #[test]
    fn appends_and_prunes_request_logs() {
        let store = SqliteConfigStore::open(":memory:").unwrap();
        seed(&store);
        let now = Utc::now();
        let entries = vec![RequestLogEntry {
            timestamp: now - chrono::Duration::days(40),
            client_ip: "10.0.0.1".into(),
            host: "example.com".into(),
            path: "/".into(),
            backend_id: 1,
            latency_ms: 5,
            status_code: 200,
            is_success: true,
            user_agent: "test".into(),
            filter_id: 0,
        }];
        store.append_request_logs(&entries).unwrap();
        let cutoff = now - chrono::Duration::days(DEFAULT_LOG_RETENTION_DAYS);
        let deleted = store.delete_logs_older_than("example.com", cutoff).unwrap();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn lists_hosts_with_retention() {
        let store = SqliteConfigStore::open(":memory:").unwrap();
        seed(&store);
        let hosts = store.list_hosts_with_retention().unwrap();
        assert_eq!(hosts, vec![HostRetention { host: "example.com".into(), retention_days: 30 }]);
    }

    #[test]
    fn a_backend_can_serve_more_than_one_host() {
        let store = SqliteConfigStore::open(":memory:").unwrap();
        seed(&store);
        let conn = store.conn.lock();
        conn.execute(
            "INSERT INTO host_rules (host, rate_limit_enabled, rate_limit_quota,
                rate_limit_period_seconds, log_retention_days, health_check_enabled)
             VALUES ('other.example.com', 0, 0, 60, 30, 0)",
            [],
        )
        .unwrap();
        let other_host_id = conn.last_insert_rowid();
        let backend_id: i64 = conn
            .query_row("SELECT id FROM backends LIMIT 1", [], |row| row.get(0))
            .unwrap();
        conn.execute(
            "INSERT INTO host_backend_map (host_rule_id, backend_id) VALUES (?1, ?2)",
            params![other_host_id, backend_id],
        )
        .unwrap();
        drop(conn);

        let rules = store.load_host_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.backends.len() == 1));
    }

    #[test]
    fn gc_deletes_backends_with_no_host_mapping() {
        let store = SqliteConfigStore::open(":memory:").unwrap();
        seed(&store);
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO backends (url, weight, active) VALUES ('http://127.0.0.1:9002', 1, 1)",
                [],
            )
            .unwrap();
        }
        let deleted = store.gc_orphan_backends().unwrap();
        assert_eq!(deleted, 1);
        let rules = store.load_host_rules().unwrap();
        assert_eq!(rules[0].backends.len(), 1);
        assert_eq!(rules[0].backends[0].url, "http://127.0.0.1:9001");
    }

    #[test]
    fn deleting_a_host_cascades_the_mapping_row() {
        let store = SqliteConfigStore::open(":memory:").unwrap();
        seed(&store);
        {
            let conn = store.conn.lock();
            conn.execute("DELETE FROM host_rules WHERE host = 'example.com'", [])
                .unwrap();
        }
        let deleted = store.gc_orphan_backends().unwrap();
        assert_eq!(deleted, 1);
    }
}
