//! # blockvault CLI
//!
//! Thin command-line surface over `blockvault-core`: create and inspect
//! stores, create and delete blobs, list what a store holds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use blockvault_core::{
    BlockBlob, Blobstore, DmRetryPolicy, OpenFlags, RevocationPolicy, SnapshotPolicy, StoreConfig,
    StoreFormat, SystemDiskUtil,
};

mod config;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Block-blob store management
#[derive(Parser)]
#[command(name = "blockvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store root directory (defaults to the configured one)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a store (or open an existing one with matching parameters)
    Init {
        /// Block budget for the store, in 512-byte blocks
        #[arg(long)]
        limit_blocks: Option<u64>,

        /// Sidecar layout: files or directory
        #[arg(long)]
        format: Option<String>,

        /// What to do when space runs out: none or lru
        #[arg(long)]
        revocation: Option<String>,

        /// Snapshot support: none or dm
        #[arg(long)]
        snapshot: Option<String>,
    },

    /// Print store metadata
    Info,

    /// List blobs with size, modification time, and in-use state
    Ls {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Create a blob of the given size
    Create {
        id: String,

        /// Size in 512-byte blocks
        #[arg(long)]
        size_blocks: u64,

        /// Signature to record with the blob
        #[arg(long)]
        sig: Option<String>,
    },

    /// Delete a blob
    Delete { id: String },
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let root = cli
        .store
        .or(config.store_root.clone())
        .context("no store given; pass --store or set store_root in the config")?;

    let mut dm_retry = DmRetryPolicy::default();
    if let Some(retries) = config.dm_remove_retries {
        dm_retry.retries = retries;
    }
    if let Some(backoff_ms) = config.dm_remove_backoff_ms {
        dm_retry.backoff = Duration::from_millis(backoff_ms);
    }

    match cli.command {
        Commands::Init {
            limit_blocks,
            format,
            revocation,
            snapshot,
        } => {
            let store = open_store(
                &root,
                StoreConfig {
                    limit_blocks: limit_blocks.or(config.limit_blocks),
                    format: format.as_deref().map(parse_format).transpose()?,
                    revocation: revocation.as_deref().map(parse_revocation).transpose()?,
                    snapshot: snapshot.as_deref().map(parse_snapshot).transpose()?,
                    dm_retry,
                },
            )?;
            println!("store {} at {}", store.id(), store.path().display());
            Ok(())
        }

        Commands::Info => {
            let store = open_store(&root, with_retry(dm_retry))?;
            println!("id:         {}", store.id());
            println!("path:       {}", store.path().display());
            println!("limit:      {} blocks", store.limit_blocks());
            println!("format:     {:?}", store.format());
            println!("revocation: {:?}", store.revocation());
            println!("snapshot:   {:?}", store.snapshot());
            Ok(())
        }

        Commands::Ls { json } => {
            let store = open_store(&root, with_retry(dm_retry))?;
            let _guard = store
                .lock(Some(DEFAULT_TIMEOUT))
                .context("failed to lock the store")?;
            let mut blobs = store.scan().context("failed to scan the store")?;
            blobs.sort_by(|a, b| a.id.cmp(&b.id));

            if json {
                println!("{}", serde_json::to_string_pretty(&blobs)?);
                return Ok(());
            }
            println!("{:<40} {:>12} {:<20} {}", "ID", "BLOCKS", "MODIFIED", "IN-USE");
            for blob in &blobs {
                let modified: DateTime<Utc> = blob.last_modified.into();
                println!(
                    "{:<40} {:>12} {:<20} {}",
                    blob.id,
                    blob.size_blocks,
                    modified.format("%Y-%m-%d %H:%M:%S"),
                    blob.in_use
                );
            }
            Ok(())
        }

        Commands::Create {
            id,
            size_blocks,
            sig,
        } => {
            let store = Arc::new(open_store(&root, with_retry(dm_retry))?);
            let blob = BlockBlob::open(
                &store,
                Some(&id),
                size_blocks,
                OpenFlags::CREATE | OpenFlags::EXCL,
                sig.as_deref(),
                Some(DEFAULT_TIMEOUT),
            )
            .with_context(|| format!("failed to create blob {}", id))?;
            println!("{} -> {}", blob.id(), blob.device_path().display());
            blob.close()
                .with_context(|| format!("failed to close blob {}", id))?;
            Ok(())
        }

        Commands::Delete { id } => {
            let store = Arc::new(open_store(&root, with_retry(dm_retry))?);
            let mut blob = BlockBlob::open(
                &store,
                Some(&id),
                0,
                OpenFlags::empty(),
                None,
                Some(DEFAULT_TIMEOUT),
            )
            .with_context(|| format!("failed to open blob {}", id))?;
            blob.delete(Some(DEFAULT_TIMEOUT))
                .with_context(|| format!("failed to delete blob {}", id))?;
            println!("deleted {}", id);
            Ok(())
        }
    }
}

fn open_store(root: &PathBuf, config: StoreConfig) -> Result<Blobstore> {
    Blobstore::open(root, config, Arc::new(SystemDiskUtil))
        .with_context(|| format!("failed to open store at {}", root.display()))
}

fn with_retry(dm_retry: DmRetryPolicy) -> StoreConfig {
    StoreConfig {
        dm_retry,
        ..Default::default()
    }
}

fn parse_format(s: &str) -> Result<StoreFormat> {
    match s {
        "files" => Ok(StoreFormat::Files),
        "directory" => Ok(StoreFormat::Directory),
        other => anyhow::bail!("unknown format '{}'; use files or directory", other),
    }
}

fn parse_revocation(s: &str) -> Result<RevocationPolicy> {
    match s {
        "none" => Ok(RevocationPolicy::None),
        "lru" => Ok(RevocationPolicy::Lru),
        other => anyhow::bail!("unknown revocation policy '{}'; use none or lru", other),
    }
}

fn parse_snapshot(s: &str) -> Result<SnapshotPolicy> {
    match s {
        "none" => Ok(SnapshotPolicy::None),
        "dm" => Ok(SnapshotPolicy::Dm),
        other => anyhow::bail!("unknown snapshot policy '{}'; use none or dm", other),
    }
}
