//! Operator tool for pond region files.
//!
//! ```bash
//! # Create a 256MB region with 8 byte keys
//! pondctl --file /dev/shm/pond format --size 268435456 --key-size 8
//!
//! # Print statistics (never modifies the region)
//! pondctl --file /dev/shm/pond info
//!
//! # Verify all bookkeeping
//! pondctl --file /dev/shm/pond check
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use shmpond::{MmapRegion, MmapRegionBuilder, Pond, PondBuilder, PondConfig};
use std::path::Path;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Format, inspect and verify pond region files
#[derive(Parser, Debug)]
#[command(name = "pondctl")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Region file
    #[arg(long, short, global = true, default_value = "pond.region", env = "POND_FILE")]
    file: PathBuf,

    /// Pond configuration (TOML)
    #[arg(long, short, global = true, env = "POND_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty pond in the region file
    Format {
        /// Region size in bytes (overrides the configuration)
        #[arg(long)]
        size: Option<usize>,

        /// Fixed key size in bytes, 0 for variable keys (overrides the
        /// configuration)
        #[arg(long)]
        key_size: Option<u16>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print region and pond statistics
    Info,

    /// Verify allocator, node group, hash and tier bookkeeping
    Check,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PondConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PondConfig::default(),
    };

    match cli.command {
        Commands::Format {
            size,
            key_size,
            force,
        } => {
            if let Some(size) = size {
                config.region_size = size;
            }
            if let Some(key_size) = key_size {
                config.key_size = key_size;
            }
            if cli.file.exists() && !force {
                bail!("{} exists, pass --force to overwrite it", cli.file.display());
            }

            let region = MmapRegionBuilder::new(&cli.file)
                .size(config.region_size)
                .truncate(true)
                .build()
                .with_context(|| format!("failed to map {}", cli.file.display()))?;
            let pond = PondBuilder::new().config(config).create(region)?;
            pond.close()?;
            info!(file = %cli.file.display(), "formatted region");
        }
        Commands::Info => {
            let pond = inspect(&cli.file, config)?;
            print_info(&pond)?;
        }
        Commands::Check => {
            let pond = inspect(&cli.file, config)?;
            if let Err(e) = pond.verify() {
                error!(error = %e, "verification failed");
                bail!("{} failed verification: {}", cli.file.display(), e);
            }
            if !pond.region_clean() {
                warn!(file = %cli.file.display(), "region was not closed cleanly");
            }
            println!("{}: ok", cli.file.display());
        }
    }
    Ok(())
}

/// Attach without touching the region: the key size comes from the
/// region itself and the clean-close flag is left as found.
fn inspect(path: &Path, config: PondConfig) -> Result<Pond<MmapRegion>> {
    let region = MmapRegionBuilder::new(path)
        .build()
        .with_context(|| format!("failed to map {}", path.display()))?;
    let pond = PondBuilder::new()
        .config(config)
        .inspect(region)
        .with_context(|| format!("failed to attach {}", path.display()))?;
    Ok(pond)
}

fn print_info(pond: &Pond<MmapRegion>) -> Result<()> {
    let heap = pond.allocator().info();
    let stats = pond.stats()?;

    println!("region");
    println!("  format version    {}", heap.version);
    println!("  total size        {}", heap.total_size);
    println!("  allocated bytes   {}", heap.user_alloc_size);
    println!("  allocated chunks  {}", heap.user_alloc_count);
    println!("  top chunk         {:#x} ({} bytes)", heap.top, heap.top_size);
    println!("  fast bin bytes    {}", heap.fast_bytes);
    println!("  closed cleanly    {}", heap.integrity);
    println!("pond");
    println!("  key size          {}", pond.config().key_size);
    println!("  records           {}", stats.used_nodes);
    println!("  dirty records     {}", stats.dirty_nodes);
    println!("  empty records     {}", stats.empty_nodes);
    println!("  rows              {}", stats.used_rows);
    println!("  dirty rows        {}", stats.dirty_rows);
    println!("  time markers      {}", stats.time_markers);
    println!("  node groups       {}", stats.node_groups);
    println!(
        "  hash buckets      {} ({} free)",
        stats.hash_buckets, stats.free_buckets
    );
    match stats.dirty_eldest_age {
        Some(age) => println!("  oldest dirty      {}s", age),
        None => println!("  oldest dirty      -"),
    }
    if pond.hash_migration_pending()? {
        println!("  hash migration    pending");
    }
    Ok(())
}
