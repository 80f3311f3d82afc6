//! # Blob caching
//!
//! The cache maps resource URLs to local [`ObjectUrl`]s, which resolve to the fetched [`Blob`]
//! through the [`ObjectUrls`] registry.
//!
//! ## Request coalescing
//!
//! The in-memory layer deduplicates concurrent accesses: the first request for a resource URL
//! starts the fetch, and everyone asking for the same URL before it finishes waits for and
//! receives the same result. Successful results are kept and replayed to later requests without
//! another fetch.
//!
//! Failures are never kept. Every waiter receives `None`, and the next request starts a fresh
//! fetch. How hard a single fetch tries is up to the [`FetchBlob`] implementation, usually a
//! [`FetchRetry`](crate::retry::FetchRetry).
//!
//! ## Eviction
//!
//! Entries leave the cache when they are deleted explicitly, when the total size of cached
//! blobs exceeds `caches.in_memory.blob_capacity`, or when they were not used for
//! `caches.in_memory.max_unused_for`. In all cases the object URL is revoked, and resolving it
//! afterwards yields nothing.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.computation`: Fetches actually started.
//! - `caches.blob.failed`: Fetches that did not produce a blob, tagged by `reason`.
//! - `caches.blob.evicted`: Entries removed from the cache, tagged by `cause`.
//! - `caches.blob.size`: A histogram of the size (in bytes) of cached blobs.
//! - `caches.blob.object_urls`: A gauge of the object URLs currently handed out.

mod cache_error;
mod memory;
mod object_urls;

pub use cache_error::{BlobError, CacheEntry};
pub use memory::{BlobCache, FetchBlob};
pub use object_urls::{Blob, ObjectUrl, ObjectUrls};
