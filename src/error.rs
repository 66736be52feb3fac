//! Error types for scopus-harvester.
//!
//! All library functions return `Result<T, HarvestError>`. The variants map onto
//! how far a failure reaches: configuration errors stop the run before it starts,
//! fetch errors end one query, authentication and storage errors end the run.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for harvest operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Invalid or incomplete harvest configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Network/HTTP transport error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A single request exceeded its deadline
    #[error("Request timed out")]
    Timeout,

    /// Rate limited by the API, with an optional server-suggested delay
    #[error("Rate limited{}", retry_suffix(.0))]
    RateLimited(Option<u64>),

    /// 5xx response from the API
    #[error("Server error: {code} - {message}")]
    Server {
        /// HTTP status code
        code: u16,
        /// Error message from API
        message: String,
    },

    /// Non-retryable API error (bad query, unsupported parameter, ...)
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Error message from API
        message: String,
    },

    /// The API rejected our credentials
    #[error("Authentication error: {code} - {message}")]
    Auth {
        /// HTTP status code
        code: u16,
        /// Error message from API
        message: String,
    },

    /// Response body could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

    /// A query gave up after exhausting its retries or hitting a non-retryable error
    #[error("Query {query_id} failed after {attempts} attempt(s): {source}")]
    Fetch {
        query_id: String,
        attempts: u32,
        #[source]
        source: Box<HarvestError>,
    },

    /// The run stopped on a fatal error; the summary covers what happened before
    #[error("Harvest aborted: {source}")]
    Aborted {
        summary: Box<crate::orchestrator::HarvestSummary>,
        #[source]
        source: Box<HarvestError>,
    },

    /// Writing output or checkpoint state failed
    #[error("Storage error at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV serialization/deserialization error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl HarvestError {
    /// Build a storage error for `path`.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited(_) | Self::Server { .. } => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether this error must abort the whole harvest run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::Storage { .. } | Self::Config(_) | Self::Aborted { .. }
        )
    }

    /// Server-suggested wait before retrying, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited(secs) => *secs,
            _ => None,
        }
    }
}

fn retry_suffix(secs: &Option<u64>) -> String {
    secs.map(|s| format!(", retry after {s}s")).unwrap_or_default()
}

/// Result type alias using `HarvestError`
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Extension trait for mapping `std::io` results onto storage errors
pub trait IoResultExt<T> {
    /// Attach the path that was being read or written
    fn storage_at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn storage_at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| HarvestError::storage(path, e))
    }
}
