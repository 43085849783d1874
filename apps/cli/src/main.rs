use anyhow::{Context, Result, bail};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use harvester::{
    HarvesterConfig, IdentifierSource, IntoProgressCallback, Orchestrator, Platform, RunContext,
    TracingProgressReporter,
};

#[derive(Debug, Parser)]
#[command(name = "harvester", version, about = "Bulk video retrieval for gated streaming platforms")]
struct Cli {
    /// JSON configuration document
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// First identifier of a numeric range
    #[arg(short, long)]
    start: Option<u64>,

    /// Last identifier of a numeric range (inclusive)
    #[arg(short, long)]
    end: Option<u64>,

    /// Pending-list file, one identifier per line; successes are removed from it
    #[arg(short, long, conflicts_with_all = ["start", "end"])]
    ids: Option<PathBuf>,

    /// Where failed identifiers are appended
    #[arg(short, long, default_value = "failed_ids.txt")]
    failed: PathBuf,

    #[arg(short, long)]
    proxy: Option<String>,

    /// Identifiers processed concurrently
    #[arg(short, long)]
    threads: Option<usize>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Session cookie (nanairo); when a stream downloader is configured it is
    /// passed on that tool's command line
    #[arg(long)]
    cookie: Option<String>,

    #[arg(long)]
    platform: Option<Platform>,

    /// Truncate the failure file before starting
    #[arg(long)]
    reset_failed: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Flags take precedence over the document
    fn apply_overrides(&self, config: &mut HarvesterConfig) {
        if let Some(platform) = self.platform {
            config.platform = platform;
        }
        if let Some(proxy) = &self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(threads) = self.threads {
            config.download_threads = threads;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(cookie) = &self.cookie {
            config.cookie = Some(cookie.clone());
        }
    }

    fn source(&self, config: &HarvesterConfig) -> Result<IdentifierSource> {
        if let Some(ids) = &self.ids {
            return Ok(IdentifierSource::ListFile(ids.clone()));
        }
        match (self.start.or(config.start_id), self.end.or(config.end_id)) {
            (Some(start), Some(end)) => return Ok(IdentifierSource::Range { start, end }),
            (Some(_), None) | (None, Some(_)) => bail!("--start and --end must be given together"),
            (None, None) => {}
        }
        if !config.ids.is_empty() {
            return Ok(IdentifierSource::Inline(config.ids.clone()));
        }
        bail!("No identifiers: pass --ids <file>, or --start and --end")
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(level),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(level))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HarvesterConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);
    init_logging(cli.verbose, config.log_file.as_deref())?;
    if !cli.config.exists() {
        warn!("Config file {} not found, running on defaults and flags", cli.config.display());
    }

    execute(&cli, config).await
}

/// Everything after logging is up; setup problems surface before the source is consulted
async fn execute(cli: &Cli, config: HarvesterConfig) -> Result<()> {
    let source = cli.source(&config)?;
    let cancel = CancellationToken::new();
    let ctx = RunContext::build(config, &source, cli.failed.clone(), cancel.clone())
        .await
        .map_err(|e| {
            error!("{}", e.detailed_report());
            e
        })?
        .with_progress(TracingProgressReporter.into_callback());

    let identifiers = source.identifiers().await?;
    if identifiers.is_empty() {
        warn!("Identifier source is empty, nothing to do");
        return Ok(());
    }
    if cli.reset_failed {
        ctx.queue.reset_failures().await?;
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after in-flight writes, partial files are kept");
            cancel.cancel();
        }
    });

    info!("Platform: {}, {} identifiers", ctx.config.platform, identifiers.len());
    let summary = Orchestrator::new(ctx).run(identifiers).await;

    for (identifier, reason) in &summary.failures {
        warn!("  {}: {}", identifier, reason);
    }
    info!("Done: {}", summary);
    Ok(())
}
