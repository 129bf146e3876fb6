//! modelcache - command-line front end for the model hash cache.
//!
//! Every command prints JSON on stdout; logs go to stderr.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "modelcache")]
#[command(about = "Index local model files by content hash and enrich them from CivitAI")]
struct Args {
    /// Configuration file (defaults to config.json in the platform data dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory holding the persisted maps
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan model roots (configured roots when none are given)
    Scan {
        roots: Vec<PathBuf>,
        /// Hash every file even if unchanged
        #[arg(long)]
        force_rehash: bool,
        /// Query the registry again for every hash seen
        #[arg(long)]
        refresh_metadata: bool,
        /// Hash only, no registry lookups
        #[arg(long)]
        skip_lookups: bool,
    },
    /// Show index statistics
    Stats,
    /// Look up a hash or a file path
    Lookup { hash_or_path: String },
    /// Force a registry lookup for a hash or a file path
    Pull { hash_or_path: String },
    /// List paths that share content
    Duplicates,
    /// List indexed paths whose files are gone
    Ghosts,
    /// Remove records of files that are gone
    PruneGhosts,
    /// Group registry models by model id
    Versions,
}

fn init_logging(debug: bool, json: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_json);

    let config = commands::resolve_config(args.config.as_deref(), args.data_dir)?;
    info!("Data directory: {}", config.data_dir.display());
    let cache = modelcache_core::ModelCache::builder(config)
        .create_data_dir(true)
        .build()
        .await?;

    match args.command {
        Command::Scan {
            roots,
            force_rehash,
            refresh_metadata,
            skip_lookups,
        } => {
            let options = modelcache_core::ScanOptions {
                force_rehash,
                refresh_metadata,
                skip_lookups,
            };
            commands::scan(&cache, roots, options).await
        }
        Command::Stats => commands::print_json(&cache.get_stats().await),
        Command::Lookup { hash_or_path } => commands::lookup(&cache, &hash_or_path).await,
        Command::Pull { hash_or_path } => {
            commands::print_json(&cache.pull_metadata(&hash_or_path).await?)
        }
        Command::Duplicates => commands::print_json(&cache.find_duplicates().await),
        Command::Ghosts => commands::print_json(&cache.find_ghosts().await?),
        Command::PruneGhosts => commands::print_json(&cache.prune_ghosts().await?),
        Command::Versions => commands::print_json(&cache.version_groups().await),
    }
}
