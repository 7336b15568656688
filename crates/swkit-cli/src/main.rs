//! Command line host for the SwKit offline cache gateway.
//!
//! Runs the gateway lifecycle against a cache directory on disk, so a site's
//! offline behaviour can be exercised without a browser.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the manifest and activate this version
//! swkit --config config/turni-vvf.json install
//!
//! # Fetch through the gateway (cache first, network, offline fallback)
//! swkit --config config/turni-vvf.json fetch ./index.html
//!
//! # Control messages and background sync
//! swkit --config config/turni-vvf.json message clearCache
//! swkit --config config/turni-vvf.json sync
//!
//! # Inspect or wipe the cache directory
//! swkit caches
//! swkit clear
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use swkit_common::{init_logging, LogConfig, LogFormat};
use swkit_net::{FetcherConfig, HttpFetcher, Request};
use swkit_sw::{
    CacheStorage, ControlMessage, DiskCacheStorage, Gateway, GatewayConfig, WorkerHost,
};
use tracing::debug;
use url::Url;

#[derive(Parser)]
#[command(name = "swkit", version)]
#[command(about = "Offline cache gateway for progressive web apps")]
struct Cli {
    /// Gateway config (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the cache storage
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the asset manifest and activate this version
    Install,

    /// Fetch a URL through the gateway
    Fetch {
        /// Absolute URL, or a path relative to the scope
        url: String,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// Post a control message to the worker
    Message {
        /// Action name, e.g. skipWaiting or clearCache
        action: String,
    },

    /// Fire a background sync
    Sync {
        /// Sync tag (defaults to the configured tag)
        tag: Option<String>,
    },

    /// List caches and their entries
    Caches,

    /// Delete every cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format: LogFormat = cli.log_format.parse()?;
    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(format))?;

    let config = match cli.config {
        Some(ref path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    let cache_dir = match cli.cache_dir {
        Some(dir) => dir,
        None => default_cache_dir()?,
    };
    let caches = Arc::new(
        DiskCacheStorage::open_dir(&cache_dir)
            .await
            .with_context(|| format!("cannot open cache directory {}", cache_dir.display()))?,
    );

    match cli.command {
        Commands::Caches => list_caches(caches.as_ref()).await?,
        Commands::Clear => {
            let gateway = gateway(config, caches)?;
            let outcome = gateway
                .handle_message(&ControlMessage::ClearCache.to_json())
                .await;
            println!("{outcome:?}");
        }
        Commands::Install => {
            let cache_name = config.cache_name();
            let host = host(&config)?;
            let id = host.register(gateway(config, caches.clone())?).await?;
            let state = match host.active_worker().await {
                Some(worker) if worker.id == id => "active",
                _ => "waiting",
            };
            println!("Worker {} {state}", id.raw());
            println!("  Cache:   {cache_name}");
            println!("  Entries: {}", caches.entries(&cache_name).await?.len());
        }
        Commands::Fetch { url, body } => {
            let url = resolve_url(&config.scope, &url)?;
            let host = running_host(config, caches).await?;
            let response = host.fetch(&Request::get(url.clone())).await;

            println!("{} {}", response.status, url);
            println!("  Type:       {}", response.response_type.as_str());
            println!("  From cache: {}", response.from_cache);
            if let Some(content_type) = response.content_type() {
                println!("  Content:    {content_type}");
            }
            println!("  Bytes:      {}", response.body.len());
            if body {
                println!();
                println!("{}", String::from_utf8_lossy(&response.body));
            }
        }
        Commands::Message { action } => {
            let host = running_host(config, caches).await?;
            let payload = serde_json::json!({ "action": action }).to_string();
            let outcome = host.post_message(&payload).await;
            println!("{outcome:?}");
        }
        Commands::Sync { tag } => {
            let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
            let host = running_host(config, caches).await?;
            host.register_sync(tag).await;
            for (tag, outcome) in host.fire_sync().await {
                println!("{tag}: {outcome:?}");
            }
        }
    }

    Ok(())
}

fn default_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("no cache directory on this platform")?;
    Ok(base.join("swkit"))
}

fn gateway(config: GatewayConfig, caches: Arc<DiskCacheStorage>) -> Result<Gateway> {
    let fetcher = fetcher(&config)?;
    Ok(Gateway::new(config, caches, fetcher)?)
}

fn fetcher(config: &GatewayConfig) -> Result<Arc<HttpFetcher>> {
    let fetcher_config = FetcherConfig {
        default_timeout: config.fetch_timeout(),
        ..Default::default()
    };
    Ok(Arc::new(HttpFetcher::new(fetcher_config, &config.scope)?))
}

fn host(config: &GatewayConfig) -> Result<WorkerHost> {
    let (host, mut events) = WorkerHost::new(config.scope.clone(), fetcher(config)?);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Lifecycle event");
        }
    });
    Ok(host)
}

/// A host with this version active, installing it first if its cache is missing.
async fn running_host(config: GatewayConfig, caches: Arc<DiskCacheStorage>) -> Result<WorkerHost> {
    let host = host(&config)?;
    host.resume(gateway(config, caches)?).await?;
    Ok(host)
}

async fn list_caches(caches: &DiskCacheStorage) -> Result<()> {
    let names = caches.keys().await?;
    if names.is_empty() {
        println!("No caches in {}", caches.dir().display());
        return Ok(());
    }
    for name in names {
        let entries = caches.entries(&name).await?;
        println!("{name} ({} entries)", entries.len());
        for key in entries {
            println!("  {key}");
        }
    }
    Ok(())
}

/// Resolve a command line URL against the scope.
fn resolve_url(scope: &Url, input: &str) -> Result<Url> {
    match Url::parse(input) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => scope
            .join(input)
            .with_context(|| format!("invalid URL '{input}'")),
        Err(e) => Err(e).with_context(|| format!("invalid URL '{input}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        let scope = Url::parse("https://turni.example.org/app/").unwrap();
        assert_eq!(
            resolve_url(&scope, "./index.html").unwrap().as_str(),
            "https://turni.example.org/app/index.html"
        );
        assert_eq!(
            resolve_url(&scope, "https://cdnjs.cloudflare.com/x.js").unwrap().as_str(),
            "https://cdnjs.cloudflare.com/x.js"
        );
        assert!(resolve_url(&scope, "http://[::1").is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "swkit",
            "fetch",
            "./index.html",
            "--body",
            "--cache-dir",
            "/tmp/swkit",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/swkit")));
        assert!(matches!(cli.command, Commands::Fetch { body: true, .. }));

        assert!(Cli::try_parse_from(["swkit", "sync"]).is_ok());
        assert!(Cli::try_parse_from(["swkit"]).is_err());
    }

    #[tokio::test]
    async fn test_list_caches_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let caches = DiskCacheStorage::open_dir(dir.path()).await.unwrap();
        list_caches(&caches).await.unwrap();
    }

    #[test]
    fn test_sample_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/turni-vvf.json");
        let config = GatewayConfig::from_file(path).unwrap();
        assert_eq!(config.cache_name(), "turni-vvf-v1");
        assert_eq!(config.manifest.len(), 7);
        assert_eq!(config.allowed_hosts.len(), 3);
    }
}
