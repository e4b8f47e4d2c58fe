use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Why a provider call failed in a way that may succeed on retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// The call exceeded its deadline or per-attempt timeout.
    Timeout,
    /// The provider answered 429 or an equivalent throttle signal.
    RateLimited,
    /// The provider answered 5xx.
    Server,
    /// Connection could not be established or was reset.
    Network,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::Timeout => "timeout",
            TransientKind::RateLimited => "rate limited",
            TransientKind::Server => "server error",
            TransientKind::Network => "network error",
        };
        f.write_str(s)
    }
}

/// Top-level error type for the lore knowledge base.
///
/// The first seven variants form the failure taxonomy that callers branch on
/// (see [`LoreError::code`]). The remaining variants cover ambient failures
/// such as bad configuration or a broken database file.
///
/// The type is `Clone` so that coalesced embedding requests can hand every
/// waiter the same error.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum LoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Provider transient failure ({kind}): {message}")]
    ProviderTransient { kind: TransientKind, message: String },

    #[error("Provider unavailable: circuit open, retry after {retry_after:?}")]
    ProviderUnavailable { retry_after: Duration },

    #[error("Provider permanent failure: {0}")]
    ProviderPermanent(String),

    #[error("Resource exhausted: {resource}, retry after {retry_after:?}")]
    ResourceExhausted {
        resource: &'static str,
        retry_after: Duration,
    },

    #[error("Dimension mismatch for {entity}: expected {expected}, got {actual}")]
    DimensionMismatch {
        entity: String,
        expected: usize,
        actual: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LoreError {
    /// Shorthand for a `Validation` error.
    pub fn validation(msg: impl Into<String>) -> Self {
        LoreError::Validation(msg.into())
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        LoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for a `ProviderTransient` error.
    pub fn transient(kind: TransientKind, msg: impl Into<String>) -> Self {
        LoreError::ProviderTransient {
            kind,
            message: msg.into(),
        }
    }

    /// True for failures that a bounded retry may cure.
    pub fn is_transient(&self) -> bool {
        matches!(self, LoreError::ProviderTransient { .. })
    }

    /// True for any failure that originated at the model provider.
    pub fn is_provider(&self) -> bool {
        matches!(
            self,
            LoreError::ProviderTransient { .. }
                | LoreError::ProviderUnavailable { .. }
                | LoreError::ProviderPermanent(_)
        )
    }

    /// True if the caller may succeed by retrying the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoreError::ProviderTransient { .. }
                | LoreError::ProviderUnavailable { .. }
                | LoreError::ResourceExhausted { .. }
        )
    }

    /// Stable snake_case identifier for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            LoreError::Validation(_) => "validation_error",
            LoreError::NotFound { .. } => "not_found",
            LoreError::ProviderTransient { .. } => "provider_transient",
            LoreError::ProviderUnavailable { .. } => "provider_unavailable",
            LoreError::ProviderPermanent(_) => "provider_permanent",
            LoreError::ResourceExhausted { .. } => "resource_exhausted",
            LoreError::DimensionMismatch { .. } => "dimension_mismatch",
            LoreError::Config(_) => "config_error",
            LoreError::Storage(_) => "storage_error",
            LoreError::Io(_) => "io_error",
            LoreError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<std::io::Error> for LoreError {
    fn from(err: std::io::Error) -> Self {
        LoreError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for LoreError {
    fn from(err: toml::de::Error) -> Self {
        LoreError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for LoreError {
    fn from(err: toml::ser::Error) -> Self {
        LoreError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for LoreError {
    fn from(err: serde_json::Error) -> Self {
        LoreError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for lore operations.
pub type Result<T> = std::result::Result<T, LoreError>;
