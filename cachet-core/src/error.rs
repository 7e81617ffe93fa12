//! Error types for cachet operations

use thiserror::Error;

/// Configuration errors.
///
/// These are caller programming errors and are always propagated. An
/// unconfigured namespace or target is *not* one of these: it only makes the
/// provider unavailable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Provider not supported: {provider}")]
    ProviderNotSupported { provider: String },
}

/// Master error type for all cachet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend {operation} failed: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("No compute function supplied for a cache miss")]
    MissingCompute,
}

impl CacheError {
    /// Build a backend error for the named operation.
    pub fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for cachet operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
