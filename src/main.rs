//! Ampelopsis main entry point
//!
//! Every pipeline stage runs as its own process; this binary selects the
//! stage with a subcommand. All of them share the configured database.

use ampelopsis::config::{load_config_with_hash, Config};
use ampelopsis::crawler::{self, Fetcher, Parser as LinkParser};
use ampelopsis::policy::resolve_instance;
use ampelopsis::storage::open_storage;
use ampelopsis::sync::{self, SyncWorker};
use ampelopsis::volume::{purge_urls, shrink_pending, Compressor, Layout};
use ampelopsis::AmpError;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Ampelopsis: a crawl-and-archive engine
///
/// Fetches documents from whitelisted hosts into loose files, extracts
/// links from them, packs finished documents into zip volumes and moves
/// documents between cooperating instances.
#[derive(Parser, Debug)]
#[command(name = "ampelopsis")]
#[command(version = "1.0.0")]
#[command(about = "A crawl-and-archive engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register hosts and enqueue start URLs
    Seed {
        /// Host to whitelist (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,

        /// Start URL (repeatable)
        #[arg(long = "url")]
        urls: Vec<String>,

        /// Owner of the hosts; defaults to the configured instance
        #[arg(long)]
        instance: Option<String>,
    },

    /// Fetch queued URLs
    Download {
        /// Run one pass and exit
        #[arg(long)]
        single_action: bool,
    },

    /// Extract links from fetched documents
    Parse {
        /// Run one pass and exit
        #[arg(long)]
        single_action: bool,
    },

    /// Pack loose documents into volumes
    Compress {
        /// Run one pass and exit
        #[arg(long)]
        single_action: bool,
    },

    /// Delete documents and their files
    Purge {
        /// URL id to delete (repeatable)
        #[arg(long = "url-id", required = true)]
        url_ids: Vec<i64>,

        /// Leave archive rewriting to a later `shrink`
        #[arg(long)]
        defer_shrink: bool,
    },

    /// Rewrite volumes without their purged members
    Shrink,

    /// Pull documents held by a peer instance
    Sync {
        /// Base URL of the peer's storage server
        #[arg(long)]
        server: String,

        /// Run one sweep and exit
        #[arg(long)]
        single_action: bool,
    },

    /// Serve stored documents to peers
    Serve,

    /// Re-enqueue fetched but unparsed documents
    Kick,

    /// Re-enqueue failed downloads
    Retry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    match run(cli.command, &config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if e.is_fatal() {
                tracing::error!("Fatal: {}", e);
            } else {
                tracing::error!("{}", e);
            }
            Err(e.into())
        }
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("ampelopsis=info,warn"),
            1 => EnvFilter::new("ampelopsis=debug,info"),
            2 => EnvFilter::new("ampelopsis=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

async fn run(command: Command, config: &Config) -> Result<(), AmpError> {
    match command {
        Command::Seed {
            hosts,
            urls,
            instance,
        } => {
            let mut storage = open_storage(&config.database)?;
            let count = crawler::seed(
                &mut storage,
                &hosts,
                &urls,
                instance.as_deref().or(config.instance.name.as_deref()),
                config.instance.match_domain,
            )?;
            println!("Seeded {} URLs", count);
        }
        Command::Download { single_action } => {
            let storage = open_storage(&config.database)?;
            let mut fetcher = Fetcher::new(storage, config)?;
            fetcher.run(single_action).await?;
        }
        Command::Parse { single_action } => {
            let storage = open_storage(&config.database)?;
            let mut parser = LinkParser::new(storage, config)?;
            parser.run(single_action).await?;
        }
        Command::Compress { single_action } => handle_compress(config, single_action).await?,
        Command::Purge {
            url_ids,
            defer_shrink,
        } => {
            let mut storage = open_storage(&config.database)?;
            let layout = Layout::from_config(config);
            let stats = purge_urls(&mut storage, &layout, &url_ids)?;
            println!(
                "Purged {} loose and {} archived documents ({} unknown)",
                stats.loose, stats.archived, stats.unknown
            );
            if !defer_shrink {
                shrink_pending(&mut storage, &layout)?;
            }
        }
        Command::Shrink => {
            let mut storage = open_storage(&config.database)?;
            let outcomes = shrink_pending(&mut storage, &Layout::from_config(config))?;
            println!("Shrank {} volumes", outcomes.len());
        }
        Command::Sync {
            server,
            single_action,
        } => {
            let storage = open_storage(&config.database)?;
            let mut worker = SyncWorker::connect(storage, config, &server).await?;
            worker.run(single_action).await?;
        }
        Command::Serve => sync::serve(config).await?,
        Command::Kick => {
            let mut storage = open_storage(&config.database)?;
            let instance_id = resolve_instance(&storage, config.instance.name.as_deref())?;
            let count = crawler::kick(&mut storage, instance_id)?;
            println!("Kicked {} documents", count);
        }
        Command::Retry => {
            let mut storage = open_storage(&config.database)?;
            let count = crawler::retry(&mut storage, config.instance.match_domain)?;
            println!("Re-enqueued {} URLs", count);
        }
    }
    Ok(())
}

/// Packs volumes, pausing `compress-backoff` seconds between passes
async fn handle_compress(config: &Config, single_action: bool) -> Result<(), AmpError> {
    let mut storage = open_storage(&config.database)?;
    let layout = Layout::from_config(config);
    let instance_id = resolve_instance(&storage, config.instance.name.as_deref())?;
    let backoff = Duration::from_secs(config.storage.compress_backoff);

    loop {
        let volumes = Compressor::new(
            &mut storage,
            &layout,
            config.storage.volume_threshold,
            instance_id,
        )
        .compress_all()?;
        for volume in &volumes {
            tracing::info!(
                "Volume {}: {} documents, {} bytes",
                volume.volume_id,
                volume.documents,
                volume.bytes
            );
        }

        if single_action {
            return Ok(());
        }
        tokio::time::sleep(backoff).await;
    }
}
