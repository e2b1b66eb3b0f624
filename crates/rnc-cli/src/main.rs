use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rnc_adapters::NormalizerVariant;
use rnc_sync::{SyncConfig, SyncPipeline};
use rnc_validate::{validate_dir, RepairLog};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rnc")]
#[command(about = "RSS news collector and partition validator")]
struct Cli {
    /// Log at debug level. RUST_LOG takes precedence.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured feeds and merge new items into the news directory.
    Collect(CollectArgs),
    /// Repair and backfill the partition files in DIR.
    Validate {
        dir: PathBuf,
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Collect, then validate the news directory.
    Run(CollectArgs),
}

#[derive(Debug, Default, Args)]
struct CollectArgs {
    #[arg(long)]
    feeds: Option<PathBuf>,
    #[arg(long)]
    news_dir: Option<PathBuf>,
    /// Leave out the `imagem` field.
    #[arg(long)]
    plain: bool,
}

impl CollectArgs {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(feeds) = self.feeds {
            config.feeds_path = feeds;
        }
        if let Some(news_dir) = self.news_dir {
            config.news_dir = news_dir;
        }
        if self.plain {
            config.variant = NormalizerVariant::Plain;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn collect(config: &SyncConfig) -> Result<()> {
    let pipeline = SyncPipeline::new(config.clone())?;
    let summary = pipeline.run_once().context("collection aborted")?;
    println!(
        "collect complete: run_id={} feeds={} failed_feeds={} collected={} admitted={} duplicates={} partitions={} failed_partitions={}",
        summary.run_id,
        summary.feeds.len(),
        summary.failed_feeds(),
        summary.collected,
        summary.admitted,
        summary.duplicates,
        summary.partitions_written,
        summary.partitions_failed
    );
    Ok(())
}

fn validate(dir: &Path, log_path: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("directory not found: {}", dir.display());
    }
    let mut log = RepairLog::open(log_path)?;
    let result = validate_dir(dir, &mut log);
    log.flush().context("flushing repair log")?;
    let summary = result?;
    println!(
        "validate complete: dir={} files={} repaired={} failed={} dropped={} backfilled={} log={}",
        dir.display(),
        summary.scanned(),
        summary.repaired(),
        summary.failed.len(),
        summary.dropped(),
        summary.backfilled(),
        log_path.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(CollectArgs::default())) {
        Commands::Collect(args) => {
            args.apply(&mut config);
            collect(&config)?;
        }
        Commands::Validate { dir, log_file } => {
            if let Some(log_file) = log_file {
                config.repair_log = log_file;
            }
            validate(&dir, &config.repair_log)?;
        }
        Commands::Run(args) => {
            args.apply(&mut config);
            let collected = collect(&config);
            if let Err(err) = &collected {
                error!(error = %format!("{err:#}"), "collection phase failed");
            }
            if config.news_dir.is_dir() {
                validate(&config.news_dir, &config.repair_log)?;
            } else {
                warn!(dir = %config.news_dir.display(), "news directory missing; skipping validation");
            }
            collected?;
        }
    }

    Ok(())
}
