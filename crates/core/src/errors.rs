//! Error types

use thiserror::Error;

/// RPC provider pool errors.
///
/// The pool recovers locally from `RateLimited`/`NetworkError` by rotating
/// providers; only retry-budget exhaustion reaches the caller.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Fatal misconfiguration, detected at construction time
    #[error("No RPC providers configured")]
    NoProviders,

    #[error("No provider available within the retry budget")]
    ProviderUnavailable,

    #[error("Rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("Network error from {provider}: {reason}")]
    NetworkError { provider: String, reason: String },

    #[error("Malformed response from {provider}: {reason}")]
    MalformedResponse { provider: String, reason: String },

    #[error("RPC error from {provider}: {message}")]
    RpcError { provider: String, message: String },
}

/// Shared cache errors.
///
/// Both variants are soft: the store degrades (proceed without lock, fall
/// back to the empty template) instead of raising into business logic.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Lock acquisition timed out after {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    #[error("Cache file is not valid JSON: {0}")]
    Corrupt(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Push feed adapter errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Feed disconnected")]
    Disconnected,

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
pub type CacheResult<T> = Result<T, CacheError>;
pub type FeedResult<T> = Result<T, FeedError>;
