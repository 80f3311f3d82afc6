//! A binary resource cache with realtime-driven retries.
//!
//! The entry point is [`BlobService`](service::BlobService), which fetches blobs referenced by
//! resource URLs, hands out local [`ObjectUrl`](caching::ObjectUrl)s for them and deduplicates
//! concurrent requests. Failed fetches are retried once an "object updated" notification for
//! the matching domain object arrives on the [`UpdateEvents`](events::UpdateEvents) stream.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod events;
pub mod identity;
pub mod retry;
pub mod service;
pub mod utils;
