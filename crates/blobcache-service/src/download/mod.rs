//! Service which fetches blobs over HTTP.
//!
//! Every call to [`DownloadService::download`] is exactly one `GET` request. Retrying is the
//! business of [`FetchRetry`](crate::retry::FetchRetry).

use std::time::Instant;

use reqwest::{StatusCode, header};
use url::Url;

use crate::caching::{Blob, BlobError, CacheEntry};
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

/// A service which can download blobs referenced by resource URLs.
#[derive(Debug)]
pub struct DownloadService {
    client: reqwest::Client,
    api_url: Option<Url>,
    timeouts: DownloadTimeouts,
}

impl DownloadService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;
        Ok(Self::with_client(client, config.api_url.clone(), timeouts))
    }

    pub fn with_client(
        client: reqwest::Client,
        api_url: Option<Url>,
        timeouts: DownloadTimeouts,
    ) -> Self {
        Self {
            client,
            api_url,
            timeouts,
        }
    }

    /// Turns a resource URL into the absolute URL it is fetched from.
    ///
    /// Relative resource URLs are joined onto the configured `api_url`.
    pub fn resolve_url(&self, url: &str) -> CacheEntry<Url> {
        match Url::parse(url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.api_url.as_ref().ok_or_else(|| {
                    BlobError::InvalidUrl(format!("`{url}` is relative and no api_url is set"))
                })?;
                base.join(url)
                    .map_err(|e| BlobError::InvalidUrl(format!("`{url}`: {e}")))
            }
            Err(e) => Err(BlobError::InvalidUrl(format!("`{url}`: {e}"))),
        }
    }

    /// Downloads the blob at `url` with a single request.
    ///
    /// This does not do any deduplication of requests, every requested blob is freshly
    /// downloaded.
    pub async fn download(&self, url: &str) -> CacheEntry<Blob> {
        let download_url = self.resolve_url(url)?;
        tracing::debug!("Fetching blob from `{}`", download_url);

        let start = Instant::now();
        let timeout = self.timeouts.max_download;
        let result = match tokio::time::timeout(timeout, self.do_download(download_url)).await {
            Ok(result) => result,
            Err(_) => Err(BlobError::Timeout(timeout)),
        };

        let status = match &result {
            Ok(_) => "success",
            Err(err) => err.metrics_tag(),
        };
        metric!(timer("service.download.duration") = start.elapsed(), "status" => status);
        metric!(counter("service.download") += 1, "status" => status);

        match &result {
            Ok(blob) => tracing::debug!(url, size = blob.len(), "Blob fetched successfully"),
            Err(err) => tracing::debug!(
                error = err as &dyn std::error::Error,
                url,
                "Blob fetching failed"
            ),
        }

        result
    }

    async fn do_download(&self, url: Url) -> CacheEntry<Blob> {
        let request = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "*/*")
            .send();
        let response = match tokio::time::timeout(self.timeouts.head, request).await {
            Ok(response) => response?,
            Err(_) => return Err(BlobError::Timeout(self.timeouts.head)),
        };

        let status = response.status();
        if status.is_success() {
            tracing::trace!("Success hitting `{url}`");
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let data = response.bytes().await?;
            if data.is_empty() {
                return Err(BlobError::NotFound);
            }
            Ok(Blob { data, content_type })
        } else if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
            tracing::debug!("Insufficient permissions to download `{url}`: {status}");
            Err(BlobError::PermissionDenied(status.to_string()))
        } else if status == StatusCode::NOT_FOUND {
            tracing::debug!("Unexpected status code from `{url}`: {status}");
            Err(BlobError::NotFound)
        } else {
            tracing::debug!("Unexpected status code from `{url}`: {status}");
            Err(BlobError::DownloadError(status.to_string()))
        }
    }
}
