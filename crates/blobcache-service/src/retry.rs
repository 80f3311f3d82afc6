//! Retries failed fetches once the resource is known to have changed.
//!
//! A failed download is not retried right away. Instead, the resource URL is mapped to the
//! domain object it belongs to, and the retry waits for a realtime notification that this
//! object was updated. Only then is the next attempt made.
//!
//! The wait is bounded by [`RetryConfig::update_wait_timeout`], and a resource that does not
//! belong to any known object is given up on immediately, since no notification can ever
//! match it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::caching::{Blob, BlobError, CacheEntry, FetchBlob};
use crate::config::RetryConfig;
use crate::download::DownloadService;
use crate::events::{UpdateEvents, UpdateSubscription, WaitOutcome};
use crate::identity::ObjectIdentifier;

/// Fetches blobs, waiting for matching update events between attempts.
pub struct FetchRetry {
    downloader: Arc<DownloadService>,
    events: Arc<dyn UpdateEvents>,
    max_attempts: usize,
    update_wait_timeout: Option<Duration>,
}

impl std::fmt::Debug for FetchRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRetry")
            .field("downloader", &self.downloader)
            .field("max_attempts", &self.max_attempts)
            .field("update_wait_timeout", &self.update_wait_timeout)
            .finish()
    }
}

impl FetchRetry {
    pub fn new(
        downloader: Arc<DownloadService>,
        events: Arc<dyn UpdateEvents>,
        config: &RetryConfig,
    ) -> Self {
        Self {
            downloader,
            events,
            max_attempts: config.max_attempts.max(1),
            update_wait_timeout: config.update_wait_timeout,
        }
    }

    /// Fetches the blob at `url`, making up to `max_attempts` attempts.
    ///
    /// Returns the error of the last attempt if none succeeded.
    pub async fn fetch(&self, url: &str) -> CacheEntry<Blob> {
        let mut attempt = 0;
        loop {
            // Subscribe before downloading, so an update that arrives while the request is
            // in flight still counts.
            let mut subscription = self.events.subscribe();
            let err = match self.downloader.download(url).await {
                Ok(blob) => return Ok(blob),
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= self.max_attempts {
                metric!(counter("retry.exhausted") += 1);
                tracing::debug!(url, attempt, "Giving up after the final attempt");
                return Err(err);
            }

            // Only keep waiting if a notification can ever match this resource.
            let object = match ObjectIdentifier::from_resource_url(url) {
                Ok(object) => object,
                Err(unresolved) => {
                    metric!(counter("retry.unresolved_identity") += 1);
                    tracing::debug!(url, "No object identity, not retrying");
                    return Err(BlobError::from(unresolved));
                }
            };

            tracing::debug!(url, attempt, %object, "Waiting for an update before retrying");
            if !self.wait_for_update(&mut subscription, &object).await {
                return Err(err);
            }
            metric!(counter("retry.attempt") += 1);
        }
    }

    /// Returns whether a matching update arrived in time.
    async fn wait_for_update(
        &self,
        subscription: &mut UpdateSubscription,
        object: &ObjectIdentifier,
    ) -> bool {
        let wait = subscription.wait_for_update(object);
        let outcome = match self.update_wait_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    metric!(counter("retry.wait_timeout") += 1);
                    tracing::debug!(%object, ?timeout, "No update arrived in time");
                    return false;
                }
            },
            None => wait.await,
        };

        match outcome {
            WaitOutcome::Updated => true,
            WaitOutcome::Closed => {
                tracing::debug!(%object, "Update events closed while waiting");
                false
            }
        }
    }
}

impl FetchBlob for FetchRetry {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheEntry<Blob>> {
        Box::pin(FetchRetry::fetch(self, url))
    }
}
