//! Error taxonomies for the loading pipeline and the cache tiers.
//!
//! [`LoadError`] is the terminal result type a caller sees; [`CacheError`]
//! is internal to the disk tier and is always recovered locally (a broken
//! cache degrades to "no cache", it never fails a request).

use thiserror::Error;

/// Result type for request execution.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Result type for disk cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Terminal errors a request can produce.
///
/// Cloneable because one execution's result is fanned out to every waiter
/// attached to the same request key.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// No registered fetcher accepted the request's uri.
    #[error("no fetcher handles uri: {0}")]
    NoFetcher(String),

    /// No registered decoder accepted the fetched content.
    #[error("no decoder handles content type: {0}")]
    NoDecoder(String),

    /// The fetch stage failed (network, filesystem, bad status).
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The decode stage failed (corrupt or unsupported payload).
    #[error("decode failed: {0}")]
    Decode(String),

    /// The target size could not be resolved before execution started.
    #[error("target size could not be resolved: {0}")]
    SizeUnresolved(String),

    /// The execution was cancelled by its last remaining waiter.
    ///
    /// A distinct terminal state, not a failure.
    #[error("request cancelled")]
    Cancelled,
}

impl LoadError {
    /// Creates a fetch error.
    #[must_use]
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Returns true if this is the cancellation terminal state.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors local to the disk cache tier.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// I/O failure while touching the cache directory.
    #[error("cache io error: {0}")]
    Io(String),

    /// The journal could not be read or parsed.
    ///
    /// Recovered by discarding the entire cache and starting empty.
    #[error("cache journal corrupt: {0}")]
    Corrupt(String),
}

impl CacheError {
    /// Creates an I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
