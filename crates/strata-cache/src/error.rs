use thiserror::Error;

/// An error that happens while loading, producing or persisting a cached value.
///
/// This error is broadcast to every observer of a cell, which is why it is [`Clone`] and only
/// carries rendered messages instead of the source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The value could not be fetched from the origin.
    ///
    /// The attached string contains the origin's error message. Origin fetches are not retried
    /// automatically, a fresh `listen` after the failed binding was dropped does that.
    #[error("origin fetch failed: {0}")]
    OriginFetch(String),
    /// A bulk write to the backing table failed.
    ///
    /// Every item of the failed batch is rejected with this error.
    #[error("batch write failed: {0}")]
    BatchWrite(String),
    /// A single lookup in the backing table failed.
    #[error("read failed: {0}")]
    Read(String),
    /// A value could not be serialized for, or deserialized from, the backing table.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The binding was evicted while its value was still being loaded.
    ///
    /// The load is aborted and whoever waited for it gets this error. Listening to the key again
    /// starts a fresh load.
    #[error("evicted while loading")]
    Evicted,
    /// An unexpected error in strata itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl CacheError {
    /// Collapses an unexpected error into an [`InternalError`](Self::InternalError), logging it.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short name for the error kind, used to tag metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::OriginFetch(_) => "origin",
            CacheError::BatchWrite(_) => "batch_write",
            CacheError::Read(_) => "read",
            CacheError::Malformed(_) => "malformed",
            CacheError::Evicted => "evicted",
            CacheError::InternalError => "internal",
        }
    }
}

/// The outcome of producing a cached value: either `Ok(T)` or the reason it is unusable.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
