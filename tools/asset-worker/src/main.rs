//! Run the AssetKit cache worker against a live origin.
//!
//! Provides commands for:
//! - Precaching a manifest and pruning old cache versions
//! - Showing how a request would be routed
//! - Routing a single request through an installed worker
//!
//! ## Usage
//!
//! ```bash
//! # Install and activate the worker, keeping buckets in storage.json
//! asset-worker precache --config worker.json --storage storage.json
//!
//! # How would a POST to /api/cart be treated?
//! asset-worker classify --config worker.json --method POST https://shop.example/api/cart
//!
//! # Load a page through the worker
//! asset-worker fetch --config worker.json --storage storage.json --navigate https://shop.example/
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use assetkit_common::{init_logging, LogConfig, LogFormat, RetryConfig};
use assetkit_net::{LoaderConfig, ResourceLoader};
use assetkit_sw::WorkerConfig;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "asset-worker")]
#[command(about = "Run the AssetKit cache worker against a live origin")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the worker (precache the manifest) and activate it
    Precache {
        /// Worker configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Cache storage file, loaded before and saved after
        #[arg(short, long)]
        storage: Option<PathBuf>,
        /// Install attempts before giving up
        #[arg(long, default_value = "1")]
        attempts: u32,
    },

    /// Show how a request would be routed
    Classify {
        /// Worker configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Request URL
        url: String,
    },

    /// Route one request through the worker, installing it first if storage lacks its cache
    Fetch {
        /// Worker configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Cache storage file, loaded before and saved after
        #[arg(short, long)]
        storage: Option<PathBuf>,
        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Request URL
        url: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(WorkerConfig::default()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_verbosity(cli.verbose).with_format(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    });
    init_logging(log_config)?;

    match cli.command {
        Commands::Precache {
            config,
            storage,
            attempts,
        } => {
            let config = load_config(config.as_ref())?;
            let loader = Arc::new(ResourceLoader::new(LoaderConfig::default())?);
            let caches = commands::load_storage(storage.as_deref()).await?;

            let session =
                commands::precache(config, loader, caches.clone(), &RetryConfig::attempts(attempts))
                    .await?;
            commands::save_storage(&caches, storage.as_deref()).await?;
            print_json(&session.report)?;
        }

        Commands::Classify {
            config,
            method,
            navigate,
            url,
        } => {
            let config = load_config(config.as_ref())?;
            let class = commands::classify_request(&config, &method, &url, navigate)?;
            print_json(&class)?;
        }

        Commands::Fetch {
            config,
            storage,
            method,
            navigate,
            url,
        } => {
            let config = load_config(config.as_ref())?;
            let loader = Arc::new(ResourceLoader::new(LoaderConfig::default())?);
            let caches = commands::load_storage(storage.as_deref()).await?;

            let mut session = commands::open_session(config, loader, caches.clone()).await?;
            let request = commands::build_request(&method, &url, navigate)?;
            let report = commands::fetch(&mut session, request).await?;

            commands::save_storage(&caches, storage.as_deref()).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
