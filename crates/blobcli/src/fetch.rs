use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use blobcache_service::config::Config;
use blobcache_service::events::{UpdateEvent, UpdateEventHub};
use blobcache_service::service::BlobService;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Fetches `urls` while forwarding update events from stdin.
pub async fn run(config: Config, urls: Vec<String>, output: PathBuf) -> Result<()> {
    let hub = UpdateEventHub::new(config.event_channel_capacity);
    tokio::spawn(forward_events(hub.clone()));
    fetch(&config, hub, &urls, &output).await
}

/// Fetches all `urls` through a fresh blob cache and writes the blobs to `output`.
async fn fetch(config: &Config, hub: UpdateEventHub, urls: &[String], output: &Path) -> Result<()> {
    tokio::fs::create_dir_all(output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;

    let service = BlobService::create(config, Arc::new(hub))?;

    let names = file_names(urls);
    let results = join_all(
        urls.iter()
            .zip(&names)
            .map(|(url, name)| fetch_one(&service, url, output.join(name))),
    )
    .await;

    let failed = results.iter().filter(|ok| !**ok).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} resources could not be fetched", urls.len());
    }
    Ok(())
}

/// Publishes JSON encoded update events read line by line from stdin.
async fn forward_events(hub: UpdateEventHub) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(error = &error as &dyn std::error::Error, "Failed reading events");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<UpdateEvent>(&line) {
            Ok(event) => {
                tracing::debug!(object = %event.object, "Received update event");
                hub.publish(event);
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    line,
                    "Skipping malformed event"
                );
            }
        }
    }
    tracing::debug!("Update events closed");
}

async fn fetch_one(service: &BlobService, url: &str, path: PathBuf) -> bool {
    let Some(object_url) = service.get_blob_url(url).await else {
        println!("{url}\tfailed");
        return false;
    };
    let Some(blob) = service.resolve_object_url(&object_url) else {
        println!("{url}\tevicted");
        return false;
    };

    match tokio::fs::write(&path, &blob.data).await {
        Ok(()) => {
            println!("{url}\t{object_url}\t{}", path.display());
            true
        }
        Err(error) => {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                path = %path.display(),
                "Failed to write blob"
            );
            false
        }
    }
}

/// Picks a distinct file name for every URL.
///
/// URLs that flatten to the same name get a numeric suffix, so no two fetches write the same file.
fn file_names(urls: &[String]) -> Vec<String> {
    let mut taken = HashSet::new();
    urls.iter()
        .map(|url| {
            let base = file_name(url);
            let mut name = base.clone();
            let mut n = 1;
            while !taken.insert(name.clone()) {
                n += 1;
                name = format!("{base}-{n}");
            }
            name
        })
        .collect()
}

/// Turns a resource URL into a flat file name.
fn file_name(url: &str) -> String {
    let path = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest)
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let name: String = path
        .trim_matches('/')
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' => c,
            _ => '_',
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '.') {
        "blob".to_owned()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_relative() {
        assert_eq!(
            file_name("/v1/users/42/picture/7/SMALL"),
            "v1_users_42_picture_7_SMALL"
        );
    }

    #[test]
    fn test_file_name_absolute() {
        assert_eq!(
            file_name("https://api.example.com/v1/a/b?token=x#frag"),
            "api.example.com_v1_a_b"
        );
    }

    #[test]
    fn test_file_name_degenerate() {
        assert_eq!(file_name("/"), "blob");
        assert_eq!(file_name(".."), "blob");
    }

    #[test]
    fn test_file_names_are_distinct() {
        let urls = ["/v1/a/b", "/v1/a_b", "/v1/a/b", "/v1/a_b-2"].map(String::from);
        assert_eq!(
            file_names(&urls),
            ["v1_a_b", "v1_a_b-2", "v1_a_b-3", "v1_a_b-2-2"]
        );
    }

    #[tokio::test]
    async fn test_fetch_writes_blobs_and_reports_failures() {
        let server = blobcache_test::BlobServer::new();
        let output = tempfile::tempdir().unwrap();
        let (path, _) = blobcache_test::user_picture();

        let config = Config {
            api_url: Some(server.base_url()),
            ..Default::default()
        };
        let urls = [path.clone(), "/missing/blob".to_owned()];
        server.fail_always("/missing/blob", blobcache_test::StatusCode::NOT_FOUND);

        let result = fetch(&config, UpdateEventHub::default(), &urls, output.path()).await;
        assert!(result.is_err());

        // the unmatched URL is given up on after its first request
        assert_eq!(server.accesses(), 2);

        let written = std::fs::read(output.path().join(file_name(&path))).unwrap();
        assert_eq!(written, blobcache_test::BlobServer::payload(&path));
    }
}
