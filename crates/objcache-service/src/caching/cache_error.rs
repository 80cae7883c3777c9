use thiserror::Error;

/// An error that happens while fetching, promoting or decoding a cached object.
///
/// All variants except [`InternalError`](Self::InternalError) describe the resource itself and
/// are delivered unchanged to every caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The source reported that the resource does not exist, or the payload was empty.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched from its source.
    ///
    /// This covers connection loss, timeouts, permission errors and 5xx responses. The attached
    /// string contains the reason reported by the source.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// The resource was fetched, but its content was rejected.
    ///
    /// Rejected content is never promoted into the cache.
    #[error("invalid content: {0}")]
    InvalidContent(String),
    /// The cached file exists but could not be turned into the requested type.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// The execution context refused the work, or dropped it before it completed.
    #[error("scheduling failed")]
    SchedulingFailed,
    /// An unexpected error in the cache itself, typically a filesystem failure.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<tokio::task::JoinError> for CacheError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Creates a [`FetchFailed`](Self::FetchFailed) error with the full chain of sources
    /// joined into one message.
    pub fn fetch_failed(err: &dyn std::error::Error) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        Self::FetchFailed(message)
    }
}

/// The result of a cache operation, containing either `Ok(T)` or an error denoting the reason
/// why an object could not be fetched or is otherwise unusable.
pub type CacheContents<T = ()> = Result<T, CacheError>;
