use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::key::ResourceKey;

/// An error that happens when loading a resource.
///
/// A `LoadError` is handed to every waiter of a coalesced load, which is why it is
/// [`Clone`]. It is never stored in the cache: the next fetch of the same key starts a
/// fresh load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The resource was not found at its location.
    #[error("not found")]
    NotFound,
    /// The resource could not be loaded due to missing permissions.
    ///
    /// The attached string contains the remote response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be loaded in time.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be downloaded due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource was loaded successfully, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The resource location cannot be served by the loader.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// An unexpected error in the loader or the cache itself.
    #[error("internal error")]
    InternalError,
}

impl LoadError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<io::Error> for LoadError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::from_std_error(err),
        }
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // the concrete timeout is not exposed by reqwest
            Self::DownloadError("request timed out".into())
        } else if let Some(status) = err.status() {
            Self::DownloadError(status.to_string())
        } else {
            Self::DownloadError(err.to_string())
        }
    }
}

/// The result of a load, shared between all waiters of the same key.
pub type LoadResult<R> = Result<std::sync::Arc<R>, LoadError>;

/// A reference count was released more often than it was acquired.
///
/// This is a bug in the caller and is never recovered from silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    /// `remove_reference` was called for a key without a matching `add_reference`.
    #[error("reference count underflow for `{key}`")]
    Underflow { key: ResourceKey },
}
