// =============================================================================
// error.rs - WHAT CAN GO WRONG, SORTED BY WHO HAS TO CARE
// =============================================================================
//
// Remote fetch failures never escape a scan: they become "gas unavailable" or
// "city failed" entries in the ScanResult. Store failures during ranking
// degrade the snapshot instead of failing the request. The only errors a
// caller of the analytics layer ever sees are "you asked for a city or gas we
// do not monitor" and, from the stores themselves, StoreError.
// =============================================================================

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures talking to the cache store or the violation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached. Usually transient.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A document could not be encoded or decoded.
    #[error("could not (de)serialize document `{key}`: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The backend answered, but not with what we asked for.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

/// Failures talking to the external gas-reading service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gas service returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("could not decode gas service response: {0}")]
    Decode(String),

    #[error("invalid gas service url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The circuit breaker for this source is open; no request was sent.
    #[error("circuit `{0}` is open, request skipped")]
    CircuitOpen(String),
}

/// Errors surfaced to callers of the scanner and analytics layers.
#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("unknown city: {0}")]
    UnknownCity(String),

    #[error("unknown gas: {0}")]
    UnknownGas(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
