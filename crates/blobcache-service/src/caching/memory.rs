use std::sync::Arc;

use futures::future::BoxFuture;
use moka::notification::RemovalCause;
use sentry::{Hub, SentryFutureExt};

use crate::config::InMemoryCacheConfig;

use super::{Blob, CacheEntry, ObjectUrl, ObjectUrls};

/// Produces the blob for a resource URL on a cache miss.
pub trait FetchBlob: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheEntry<Blob>>;
}

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct CachedBlob {
    /// The handle given out to requesters.
    object_url: ObjectUrl,
    /// The size of the blob in bytes, used as the cache weight.
    size: u32,
}

type InMemoryCache = moka::future::Cache<String, CachedBlob>;

/// Caches object URLs of fetched blobs by resource URL.
///
/// Concurrent requests for the same resource are coalesced into a single fetch, and all of them
/// receive its result. Only successful fetches are kept, a failure is handed to everyone who
/// was waiting for it and then forgotten, so that the next request starts over.
///
/// Object URLs are revoked as soon as their entry leaves the cache, whether it was deleted
/// explicitly, pushed out by the size limit, or expired after being idle.
pub struct BlobCache {
    cache: InMemoryCache,
    object_urls: Arc<ObjectUrls>,
    fetcher: Arc<dyn FetchBlob>,
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("in-memory items", &self.cache.entry_count())
            .field("weighted size", &self.cache.weighted_size())
            .field("object urls", &self.object_urls.len())
            .finish()
    }
}

fn removal_cause_tag(cause: RemovalCause) -> &'static str {
    match cause {
        RemovalCause::Expired => "expired",
        RemovalCause::Explicit => "explicit",
        RemovalCause::Replaced => "replaced",
        RemovalCause::Size => "size",
    }
}

impl BlobCache {
    pub fn new(
        config: &InMemoryCacheConfig,
        object_urls: Arc<ObjectUrls>,
        fetcher: Arc<dyn FetchBlob>,
    ) -> Self {
        let listener_urls = Arc::clone(&object_urls);
        let mut builder = InMemoryCache::builder()
            .name("blobs")
            .max_capacity(config.blob_capacity)
            .weigher(|_k, v: &CachedBlob| v.size.max(1))
            .eviction_listener(move |key, value: CachedBlob, cause| {
                listener_urls.revoke(&value.object_url);
                metric!(gauge("caches.blob.object_urls") = listener_urls.len() as u64);
                metric!(
                    counter("caches.blob.evicted") += 1,
                    "cause" => removal_cause_tag(cause),
                );
                tracing::trace!(
                    url = %key,
                    object_url = %value.object_url,
                    ?cause,
                    "Released blob"
                );
            });

        if let Some(max_unused_for) = config.max_unused_for {
            builder = builder.time_to_idle(max_unused_for);
        }

        Self {
            cache: builder.build(),
            object_urls,
            fetcher,
        }
    }

    /// Returns the object URL for the blob at `url`, fetching it on a miss.
    ///
    /// Resolves to `None` if the blob could not be fetched.
    pub async fn get_blob_url(&self, url: &str) -> Option<ObjectUrl> {
        metric!(counter("caches.access") += 1, "cache" => "blobs");

        let entry = self
            .cache
            .entry_by_ref(url)
            .or_optionally_insert_with(Box::pin(
                self.compute(url)
                    .bind_hub(Hub::new_from_top(Hub::current())),
            ))
            .await?;

        if !entry.is_fresh() {
            metric!(counter("caches.memory.hit") += 1, "cache" => "blobs");
        }
        Some(entry.into_value().object_url)
    }

    /// Removes the entry for `url`, revoking its object URL.
    ///
    /// This is a no-op if `url` is not cached. A fetch that is still in flight is not cancelled.
    pub async fn delete_cached_blob(&self, url: &str) {
        tracing::trace!(url, "Deleting cached blob");
        self.cache.invalidate(url).await;
    }

    /// Whether a resolved entry for `url` is cached.
    pub fn contains(&self, url: &str) -> bool {
        self.cache.contains_key(url)
    }

    /// Runs pending maintenance such as size-based eviction.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn object_urls(&self) -> &ObjectUrls {
        &self.object_urls
    }

    async fn compute(&self, url: &str) -> Option<CachedBlob> {
        metric!(counter("caches.computation") += 1, "cache" => "blobs");

        match self.fetcher.fetch(url).await {
            Ok(blob) => {
                metric!(time_raw("caches.blob.size") = blob.len() as u64);
                let size = u32::try_from(blob.len()).unwrap_or(u32::MAX);
                let object_url = self.object_urls.create(blob);
                metric!(gauge("caches.blob.object_urls") = self.object_urls.len() as u64);
                tracing::debug!(url, %object_url, size, "Cached blob");
                Some(CachedBlob { object_url, size })
            }
            Err(err) => {
                metric!(counter("caches.blob.failed") += 1, "reason" => err.metrics_tag());
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    url,
                    "Blob is unavailable"
                );
                None
            }
        }
    }
}
