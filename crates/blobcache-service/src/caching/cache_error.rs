use std::error::Error;
use std::time::Duration;

use thiserror::Error;

use crate::identity::UnresolvedIdentity;

/// An error that happens when fetching a blob.
///
/// None of these reach consumers of the cached path, which only ever sees "no blob".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    /// The resource does not exist, or the server returned no content for it.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the server's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The resource URL cannot be turned into a request.
    #[error("invalid resource url: {0}")]
    InvalidUrl(String),
    /// A fetch failed and the resource does not belong to any known object, so no update
    /// notification can ever trigger a retry.
    #[error("unresolved identity: {0}")]
    UnresolvedIdentity(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl BlobError {
    /// Builds a [`DownloadError`](Self::DownloadError) from the innermost cause of `error`.
    pub fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::DownloadError(error_string)
    }

    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable name of the variant used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::InvalidUrl(_) => "invalidurl",
            Self::UnresolvedIdentity(_) => "unresolvedidentity",
            Self::InternalError => "internalerror",
        }
    }
}

impl From<reqwest::Error> for BlobError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl From<UnresolvedIdentity> for BlobError {
    fn from(error: UnresolvedIdentity) -> Self {
        Self::UnresolvedIdentity(error.0)
    }
}

impl From<std::io::Error> for BlobError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// The outcome of fetching an item, either `Ok(T)` or the reason why it is unavailable.
pub type CacheEntry<T = ()> = Result<T, BlobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_download_error_uses_innermost_cause() {
        let inner =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = BlobError::download_error(&Outer(inner));
        assert_eq!(err, BlobError::DownloadError("connection refused".into()));
    }

    #[test]
    fn test_unresolved_identity() {
        let err = BlobError::from(UnresolvedIdentity("/nope".into()));
        assert_eq!(err.to_string(), "unresolved identity: /nope");
        assert_eq!(err.metrics_tag(), "unresolvedidentity");
    }
}
