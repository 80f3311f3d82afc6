//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use blobcache_service::config::Config;
use blobcache_service::identity::ObjectIdentifier;
use blobcache_service::metrics;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::fetch;
use crate::logging;

/// blobcli commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch resources through the blob cache and write them to a directory.
    ///
    /// Realtime update events are read as JSON lines from stdin while fetching, so that failed
    /// fetches can be retried by piping in an `Updated` event for their object.
    Fetch {
        /// The resource URLs to fetch.
        #[arg(required = true)]
        urls: Vec<String>,

        /// The directory to write the blobs to.
        #[arg(long, short, value_name = "DIR")]
        output: PathBuf,
    },

    /// Print the object each resource URL belongs to.
    Match {
        /// The resource URLs to match.
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Base URL for relative resource URLs, overriding the configuration.
    #[arg(long, global = true)]
    api_url: Option<Url>,

    /// The log level, overriding the configuration.
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = Some(api_url);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is started below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, name);
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure metrics")?;
    }

    match cli.command {
        Command::Match { urls } => {
            print_matches(&urls);
            Ok(())
        }
        Command::Fetch { urls, output } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the runtime")?;
            let result = runtime.block_on(fetch::run(config, urls, output));
            // Reading stdin blocks a thread that would otherwise hold up the shutdown.
            runtime.shutdown_background();
            result
        }
    }
}

fn print_matches(urls: &[String]) {
    let matches: BTreeMap<_, _> = urls
        .iter()
        .map(|url| (url, ObjectIdentifier::from_resource_url(url)))
        .collect();

    for (url, identity) in matches {
        match identity {
            Ok(identity) => println!("{url}\t{identity}"),
            Err(err) => println!("{url}\t-\t{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "blobcli",
            "--api-url",
            "https://api.example.com/",
            "fetch",
            "/v1/a",
            "/v1/b",
            "-o",
            "out",
        ])
        .unwrap();

        assert_eq!(cli.api_url.unwrap().as_str(), "https://api.example.com/");
        match cli.command {
            Command::Fetch { urls, output } => {
                assert_eq!(urls, ["/v1/a", "/v1/b"]);
                assert_eq!(output, PathBuf::from("out"));
            }
            command => panic!("unexpected command {command:?}"),
        }
    }

    #[test]
    fn test_fetch_requires_urls() {
        assert!(Cli::try_parse_from(["blobcli", "fetch", "-o", "out"]).is_err());
    }

    #[test]
    fn test_global_log_level() {
        let cli =
            Cli::try_parse_from(["blobcli", "match", "/v1/a", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, Some(LevelFilter::DEBUG));
    }
}
