//! Error types for Bulwark

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by loader and persist failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in Bulwark
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Circuit Breaker Errors
    // =========================================================================
    /// Breaker is open and no fallback was supplied
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Store backend could not complete an operation
    #[error("Cache backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Requested a store strategy that is not registered
    #[error("Unknown cache strategy: {0}")]
    UnknownStrategy(String),

    /// Stampede waiter gave up waiting on another loader
    #[error("Lock wait for key '{key}' exceeded {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    /// Caller-supplied loader or persist function failed
    #[error("Loader failed: {0}")]
    Loader(#[source] BoxError),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an arbitrary error raised by a loader or persist function
    pub fn loader<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Loader(err.into())
    }

    /// Build a backend failure for the named store
    pub fn backend(backend: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::BackendUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the caller should treat this as "service unavailable"
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// True for transient store failures
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}
