//! Error taxonomy, per §7. Each concern gets its own `thiserror` enum rather
//! than one catch-all, following the teacher's `DatabaseError` pattern in
//! `router-api/src/module/database.rs`.

use thiserror::Error;

/// Errors surfaced by the config store facade (§4.1, §7 `ConfigurationError`).
///
/// A `DatabaseError` on a cache refresh is recoverable: the caller preserves
/// the existing cache and retries at the next tick (§4.2 Failure semantics).
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database connection not initialized")]
    NotInitialized,
}

/// Errors the request pipeline maps to a client-visible status (§7).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no route configured for host {host}")]
    NoRoute { host: String },

    #[error("rate limit exceeded for {client_ip} on {host}")]
    RateLimited { client_ip: String, host: String },

    #[error("upstream error contacting {backend}: {source}")]
    Upstream {
        backend: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PipelineError {
    /// The status code this error maps to when written directly to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::NoRoute { .. } => 410,
            PipelineError::RateLimited { .. } => 429,
            PipelineError::Upstream { .. } => 502,
        }
    }
}

/// Raised internally by the buffered log sink after exhausting retries
/// (§4.8, §7 `LogDropError`). Never propagated to the request path.
#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("dropped a batch of {count} entries after {attempts} failed attempts: {last}")]
    Dropped {
        count: usize,
        attempts: u32,
        last: DatabaseError,
    },
}
