//! Error types for fedra-rdbc
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (pool exhaustion, connection failures)
//! - Non-retriable errors (configuration, shutdown)

use std::fmt;
use thiserror::Error;

/// Result type for fedra-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which admission limit an exhausted acquire ran into.
///
/// Distinguishing identity-local from pool-wide exhaustion matters for
/// operators: the former points at one hot credential context, the latter
/// at the pool as a whole being undersized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExhaustionScope {
    /// The pool-wide `max_connections` limit
    Global,
    /// The per-identity `max_connections_per_identity` sub-quota
    Identity,
}

impl fmt::Display for ExhaustionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Identity => write!(f, "identity"),
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection creation/close errors (retriable)
    Connection,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Pool is shutting down (not retriable)
    ShuttingDown,
    /// Configuration error (fatal at initialization)
    Configuration,
    /// Distributed-transaction errors
    Transaction,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::PoolExhausted)
    }
}

/// Main error type for fedra-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid pool configuration; the pool never becomes usable
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// An acquire timed out waiting on an admission limit
    #[error("pool exhausted ({scope}): {message}")]
    PoolExhausted {
        scope: ExhaustionScope,
        message: String,
    },

    /// Opening or closing a physical connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Acquire attempted after `shutdown()`; always fails fast
    #[error("pool is shutting down")]
    ShuttingDown,

    /// Distributed-transaction error
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::ShuttingDown => ErrorCategory::ShuttingDown,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool-exhausted error
    pub fn exhausted(scope: ExhaustionScope, message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            scope,
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Configuration => write!(f, "configuration"),
            Self::Transaction => write!(f, "transaction"),
            Self::Other => write!(f, "other"),
        }
    }
}
