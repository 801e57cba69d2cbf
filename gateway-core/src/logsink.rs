//! Buffered log sink (§4.8). Entries accumulate under a short lock and are
//! flushed to the config store as a single transaction, either when the
//! buffer crosses a threshold or on a timer tick. Retries with exponential
//! back-off; a batch that still fails is dropped and logged, never
//! propagated to the request path (§7 `LogDropError`).

use std::sync::Arc;
use std::time::Duration;

use log::error;
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::config_store::ConfigStore;
use crate::error::LogSinkError;
use crate::model::{FilterLogEntry, RequestLogEntry};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 100;

pub struct LogSinkConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Buffer {
    request_logs: Vec<RequestLogEntry>,
}

/// Shared between the submitting request tasks and the background flush
/// loop; construct once per process and hold behind an `Arc`.
pub struct BufferedLogSink {
    store: Arc<dyn ConfigStore>,
    buffer: Mutex<Buffer>,
    config: LogSinkConfig,
}

impl BufferedLogSink {
    pub fn new(store: Arc<dyn ConfigStore>, config: LogSinkConfig) -> Self {
        Self {
            store,
            buffer: Mutex::new(Buffer::default()),
            config,
        }
    }

    /// Appends a request-log entry and reports whether the caller should
    /// trigger an immediate flush (buffer crossed the batch threshold).
    pub fn submit(&self, entry: RequestLogEntry) -> bool {
        let mut buffer = self.buffer.lock();
        buffer.request_logs.push(entry);
        buffer.request_logs.len() >= self.config.batch_size
    }

    /// Filter-log entries are written directly, per entry, per §4.8's
    /// "implementation choice is not user-visible" clause. A failure here is
    /// logged and swallowed, never surfaced to the request path.
    pub fn submit_filter_log(&self, entry: &FilterLogEntry) {
        if let Err(e) = self.store.append_filter_log(entry) {
            error!("failed to persist filter-log entry for rule {}: {e}", entry.filter_id);
        }
    }

    /// Copies and clears the buffer, then flushes outside the lock with
    /// retry. Safe to call concurrently; overlapping flushes each drain
    /// whatever has accumulated since the last one.
    pub async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut buffer.request_logs)
        };
        if batch.is_empty() {
            return;
        }
        if let Err(LogSinkError::Dropped { count, attempts, last }) = self.flush_batch(&batch).await {
            error!("dropped a log batch of {count} entries after {attempts} attempts: {last}");
        }
    }

    async fn flush_batch(&self, batch: &[RequestLogEntry]) -> Result<(), LogSinkError> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.store.append_request_logs(batch) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        let backoff = BASE_BACKOFF_MS * (1u64 << (attempt - 1));
                        sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(LogSinkError::Dropped {
            count: batch.len(),
            attempts: MAX_ATTEMPTS,
            last: last_err.expect("loop runs at least once"),
        })
    }

    /// Runs the timer-driven flush loop until `shutdown` resolves, then
    /// performs one final flush before returning (§5 shutdown sequence).
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.flush().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::FakeConfigStore;
    use chrono::Utc;

    fn entry() -> RequestLogEntry {
        RequestLogEntry {
            timestamp: Utc::now(),
            client_ip: "192.0.2.5".into(),
            host: "api.test".into(),
            path: "/ping".into(),
            backend_id: 1,
            latency_ms: 3,
            status_code: 200,
            is_success: true,
            user_agent: "test".into(),
            filter_id: 0,
        }
    }

    #[tokio::test]
    async fn flush_writes_through_to_the_store() {
        let store = Arc::new(FakeConfigStore::new());
        let sink = BufferedLogSink::new(store.clone(), LogSinkConfig { batch_size: 50, flush_interval: Duration::from_secs(5) });
        sink.submit(entry());
        sink.submit(entry());
        sink.flush().await;
        assert_eq!(store.request_logs().len(), 2);
    }

    #[test]
    fn submit_reports_threshold_crossing() {
        let store = Arc::new(FakeConfigStore::new());
        let sink = BufferedLogSink::new(store, LogSinkConfig { batch_size: 2, flush_interval: Duration::from_secs(5) });
        assert!(!sink.submit(entry()));
        assert!(sink.submit(entry()));
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let store = Arc::new(FakeConfigStore::new());
        let sink = BufferedLogSink::new(store.clone(), LogSinkConfig::default());
        sink.flush().await;
        assert!(store.request_logs().is_empty());
    }
}
