//! The public face of the blob cache.

use std::sync::Arc;

use crate::caching::{Blob, BlobCache, CacheEntry, ObjectUrl, ObjectUrls};
use crate::config::Config;
use crate::download::DownloadService;
use crate::events::UpdateEvents;
use crate::retry::FetchRetry;

/// Fetches blobs and hands out cached object URLs for them.
///
/// One instance is meant to live as long as the session that uses it. Instances share nothing,
/// dropping one releases all of its object URLs.
#[derive(Debug)]
pub struct BlobService {
    downloader: Arc<DownloadService>,
    cache: BlobCache,
    object_urls: Arc<ObjectUrls>,
}

impl BlobService {
    /// Creates a service that retries failed fetches on updates from `events`.
    pub fn create(config: &Config, events: Arc<dyn UpdateEvents>) -> anyhow::Result<Arc<Self>> {
        let downloader = Arc::new(DownloadService::new(config)?);
        Ok(Arc::new(Self::with_downloader(config, downloader, events)))
    }

    pub fn with_downloader(
        config: &Config,
        downloader: Arc<DownloadService>,
        events: Arc<dyn UpdateEvents>,
    ) -> Self {
        let object_urls = Arc::new(ObjectUrls::new());
        let fetcher = Arc::new(FetchRetry::new(
            Arc::clone(&downloader),
            events,
            &config.retries,
        ));
        let cache = BlobCache::new(&config.caches.in_memory, Arc::clone(&object_urls), fetcher);

        Self {
            downloader,
            cache,
            object_urls,
        }
    }

    /// Fetches the blob at `url`, bypassing the cache.
    ///
    /// Every call makes exactly one request, failures are returned as they are.
    pub async fn get_blob(&self, url: &str) -> CacheEntry<Blob> {
        self.downloader.download(url).await
    }

    /// Returns a cached object URL for the blob at `url`.
    ///
    /// Concurrent calls share one fetch. A failed fetch is retried when the object the
    /// resource belongs to is updated, and resolves to `None` once retries are exhausted.
    pub async fn get_blob_url(&self, url: &str) -> Option<ObjectUrl> {
        self.cache.get_blob_url(url).await
    }

    /// Drops the cached blob for `url`, so the next request fetches it again.
    pub async fn delete_cached_blob(&self, url: &str) {
        self.cache.delete_cached_blob(url).await
    }

    /// Returns the blob behind an object URL, unless it was released.
    pub fn resolve_object_url(&self, object_url: &ObjectUrl) -> Option<Blob> {
        self.object_urls.resolve(object_url)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blobcache_test::{BlobServer, setup, user_picture};
    use futures::future::join_all;
    use reqwest::StatusCode;

    use crate::caching::BlobError;
    use crate::events::{UpdateEvent, UpdateEventHub};
    use crate::identity::{ObjectIdentifier, ObjectType};

    use super::*;

    fn service(server: &BlobServer, hub: &UpdateEventHub) -> Arc<BlobService> {
        let config = Config {
            api_url: Some(server.base_url()),
            ..Default::default()
        };
        BlobService::create(&config, Arc::new(hub.clone())).unwrap()
    }

    fn updated(picture_id: &str) -> UpdateEvent {
        UpdateEvent::updated(ObjectIdentifier::new(ObjectType::UserPicture, picture_id))
    }

    #[tokio::test]
    async fn test_first_try_success() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, _) = user_picture();

        let object_url = service.get_blob_url(&path).await.unwrap();
        let blob = service.resolve_object_url(&object_url).unwrap();
        assert_eq!(blob.data, BlobServer::payload(&path));
        assert_eq!(server.hits(&path), 1);
    }

    #[tokio::test]
    async fn test_recovers_on_third_attempt() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, picture_id) = user_picture();
        server.fail_next(&path, 2, StatusCode::NOT_FOUND);

        let request = {
            let service = Arc::clone(&service);
            let path = path.clone();
            tokio::spawn(async move { service.get_blob_url(&path).await })
        };
        for attempt in 1..=2 {
            server.wait_for_hits(&path, attempt).await;
            hub.publish(updated(&picture_id));
        }

        let object_url = request.await.unwrap().unwrap();
        assert_eq!(server.hits(&path), 3);
        assert!(service.resolve_object_url(&object_url).is_some());
    }

    #[tokio::test]
    async fn test_short_user_picture_path() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let path = "/v1/users/abc/picture/xyz/SMALL";
        server.fail_next(path, 1, StatusCode::NOT_FOUND);

        let request = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.get_blob_url(path).await })
        };
        server.wait_for_hits(path, 1).await;
        hub.publish(updated("xyz"));

        assert!(request.await.unwrap().is_some());
        assert_eq!(server.hits(path), 2);
    }

    #[tokio::test]
    async fn test_exhausted_resolves_to_none() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, picture_id) = user_picture();
        server.fail_always(&path, StatusCode::SERVICE_UNAVAILABLE);

        let request = {
            let service = Arc::clone(&service);
            let path = path.clone();
            tokio::spawn(async move { service.get_blob_url(&path).await })
        };
        for attempt in 1..=2 {
            server.wait_for_hits(&path, attempt).await;
            hub.publish(updated(&picture_id));
        }

        assert_eq!(request.await.unwrap(), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.hits(&path), 3);
    }

    #[tokio::test]
    async fn test_simultaneous_callers_share_one_fetch() {
        setup();
        let server = BlobServer::new();
        server.set_delay(Duration::from_millis(100));
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, _) = user_picture();

        let results = join_all((0..5).map(|_| service.get_blob_url(&path))).await;

        assert_eq!(server.hits(&path), 1);
        let first = results[0].clone().unwrap();
        assert!(results.iter().all(|r| r.as_ref() == Some(&first)));
    }

    #[tokio::test]
    async fn test_replays_without_fetching() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, _) = user_picture();

        let first = service.get_blob_url(&path).await;
        let second = service.get_blob_url(&path).await;

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(server.hits(&path), 1);
    }

    #[tokio::test]
    async fn test_delete_causes_refetch() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, _) = user_picture();

        let first = service.get_blob_url(&path).await.unwrap();
        service.delete_cached_blob(&path).await;
        let second = service.get_blob_url(&path).await.unwrap();

        assert_eq!(server.hits(&path), 2);
        assert_ne!(first, second);
        assert_eq!(service.resolve_object_url(&first), None);
        assert!(service.resolve_object_url(&second).is_some());
    }

    #[tokio::test]
    async fn test_get_blob_is_uncached() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let service = service(&server, &hub);
        let (path, _) = user_picture();

        let first = service.get_blob(&path).await.unwrap();
        let second = service.get_blob(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.hits(&path), 2);

        server.fail_next(&path, 1, StatusCode::NOT_FOUND);
        assert_eq!(service.get_blob(&path).await, Err(BlobError::NotFound));
        assert_eq!(server.hits(&path), 3);
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        setup();
        let server = BlobServer::new();
        let hub = UpdateEventHub::default();
        let one = service(&server, &hub);
        let other = service(&server, &hub);
        let (path, _) = user_picture();

        let object_url = one.get_blob_url(&path).await.unwrap();
        assert_eq!(other.resolve_object_url(&object_url), None);
        other.get_blob_url(&path).await.unwrap();
        assert_eq!(server.hits(&path), 2);
    }
}
