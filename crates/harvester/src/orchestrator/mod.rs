//! Run driver
//!
//! [`RunContext`] holds everything a run shares between workers; it is built
//! once, up front, so configuration problems surface before any identifier is
//! touched. [`Orchestrator::run`] then pushes identifiers through
//! resolve → select → download → decrypt → record on a bounded worker pool.
//! A failing identifier is recorded and the pool carries on.

use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{HarvesterConfig, Platform};
use crate::downloader::core::files::url_hint;
use crate::downloader::core::{DownloadMetricsSnapshot, HarvestError, ProgressCallback, Result};
use crate::downloader::{ChunkedDownloader, DownloadTask};
use crate::external::stream_tool::existing_output;
use crate::external::{Decryptor, StreamTool};
use crate::manifest::{self, MediaKind, Representation, hls};
use crate::queue::WorkQueue;
use crate::resolver::{self, ManifestReference, ResolvedMedia, Resolver};
use crate::session::AuthContext;
use crate::source::IdentifierSource;

/// Shared, read-mostly state of one run
pub struct RunContext {
    pub config: HarvesterConfig,
    pub auth: Arc<AuthContext>,
    pub resolver: Arc<dyn Resolver>,
    pub downloader: ChunkedDownloader,
    pub queue: Arc<WorkQueue>,
    /// Decryptor for platforms that need one
    pub decryptor: Option<Decryptor>,
    /// External segment downloader, preferred over the built-in one when set
    pub stream_tool: Option<StreamTool>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

impl RunContext {
    /// Validate the configuration and assemble every shared component
    pub async fn build(
        config: HarvesterConfig,
        source: &IdentifierSource,
        failure_file: PathBuf,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let auth = Arc::new(AuthContext::from_config(&config));
        let resolver = resolver::for_platform(&config, auth.clone(), cancel.clone())?;
        let downloader = ChunkedDownloader::new(auth.download_client()?, config.download_config())
            .with_cancellation(cancel.clone());
        let queue = Arc::new(WorkQueue::open(failure_file, source.list_file().cloned()).await?);

        let (decryptor, stream_tool) = match (config.platform, &config.external_tool_path) {
            (Platform::Mgstage, Some(tool)) => (Some(Decryptor::new(tool.clone(), &config)), None),
            (Platform::Mgstage, None) => {
                warn!("No decryptor configured; downloads will be left encrypted");
                (None, None)
            }
            (Platform::Nanairo, Some(tool)) => {
                if auth.cookie().is_some() {
                    warn!("The stream downloader receives the cookie as a -H argument; it is visible in the local process list");
                }
                (None, Some(StreamTool::new(tool.clone(), &config)))
            }
            (Platform::Nanairo, None) => (None, None),
        };

        Ok(Self {
            config,
            auth,
            resolver,
            downloader,
            queue,
            decryptor,
            stream_tool,
            cancel,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Terminal state of one identifier
#[derive(Debug)]
pub enum IdentifierOutcome {
    Succeeded(PathBuf),
    /// Final output was already present
    SkippedExisting(PathBuf),
    Failed(HarvestError),
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped_existing: usize,
    pub duration: Duration,
    pub metrics: DownloadMetricsSnapshot,
    /// Failed identifiers with their error, in completion order
    pub failures: Vec<(String, String)>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled + self.skipped_existing
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} already present, {} failed, {} cancelled in {:.1}s ({:.1} MB transferred)",
            self.succeeded,
            self.skipped_existing,
            self.failed,
            self.cancelled,
            self.duration.as_secs_f64(),
            self.metrics.total_bytes as f64 / 1_048_576.0,
        )
    }
}

pub struct Orchestrator {
    ctx: RunContext,
}

impl Orchestrator {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Process every identifier with at most `download_threads` in flight
    pub async fn run(&self, identifiers: Vec<String>) -> RunSummary {
        let started = Instant::now();
        let workers = self.ctx.config.download_threads.max(1);
        info!("Processing {} identifiers with {} worker(s)", identifiers.len(), workers);

        let outcomes: Vec<(String, IdentifierOutcome)> = stream::iter(identifiers)
            .map(|identifier| async move {
                let span = info_span!("identifier", id = %identifier);
                let outcome = self.process(&identifier).instrument(span.clone()).await;
                self.record(&identifier, &outcome).instrument(span).await;
                (identifier, outcome)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for (identifier, outcome) in outcomes {
            match outcome {
                IdentifierOutcome::Succeeded(_) => summary.succeeded += 1,
                IdentifierOutcome::SkippedExisting(_) => summary.skipped_existing += 1,
                IdentifierOutcome::Cancelled => summary.cancelled += 1,
                IdentifierOutcome::Failed(error) => {
                    summary.failed += 1;
                    summary.failures.push((identifier, error.to_string()));
                }
            }
        }
        summary.duration = started.elapsed();
        summary.metrics = self.ctx.downloader.metrics().snapshot();

        info!("Run finished: {}", summary);
        debug!(
            "Transfers: {} started, {:.0}% complete, {} resumed, {} retries",
            summary.metrics.total_downloads,
            summary.metrics.success_rate() * 100.0,
            summary.metrics.resumed_downloads,
            summary.metrics.retries_attempted,
        );
        if summary.failed > 0 {
            warn!("Failed identifiers were written to {}", self.ctx.queue.failure_file().display());
        }
        summary
    }

    async fn process(&self, identifier: &str) -> IdentifierOutcome {
        if self.ctx.cancel.is_cancelled() {
            return IdentifierOutcome::Cancelled;
        }
        info!("Processing {}", identifier);

        let result = match self.ctx.config.platform {
            Platform::Mgstage => self.process_protected(identifier).await,
            Platform::Nanairo => self.process_open(identifier).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(error) if error.is_cancelled() => {
                info!("{} interrupted; partial files kept for resume", identifier);
                IdentifierOutcome::Cancelled
            }
            Err(error) => {
                error!(category = error.category(), "{} failed: {}", identifier, error);
                debug!("{}", error.detailed_report());
                IdentifierOutcome::Failed(error)
            }
        }
    }

    /// MPD with separate video and audio, decrypted into one container
    async fn process_protected(&self, identifier: &str) -> Result<IdentifierOutcome> {
        let config = &self.ctx.config;
        let upper = identifier.to_uppercase();
        let final_output = config.decrypted_dir.join(format!("{}.mkv", upper));
        if final_output.exists() {
            info!("{} already decrypted at {}", identifier, final_output.display());
            return Ok(IdentifierOutcome::SkippedExisting(final_output));
        }

        let video_path = config.output_dir.join(format!("{}_video.mp4", upper));
        let audio_path = config.output_dir.join(format!("{}_audio.mp4", upper));
        if video_path.exists() && audio_path.exists() {
            info!("{} assets already downloaded", identifier);
        } else {
            self.download_protected_assets(identifier, &video_path, &audio_path).await?;
        }

        match &self.ctx.decryptor {
            Some(decryptor) => {
                let output = decryptor
                    .decrypt(identifier, &video_path, Some(&audio_path), &self.ctx.cancel)
                    .await?;
                Ok(IdentifierOutcome::Succeeded(output))
            }
            None => Ok(IdentifierOutcome::Succeeded(video_path)),
        }
    }

    async fn download_protected_assets(&self, identifier: &str, video_path: &Path, audio_path: &Path) -> Result<()> {
        let media = self.ctx.resolver.resolve(identifier).await?;
        let manifest_bytes = self.ctx.resolver.fetch_manifest(&media.manifest).await?;
        let selection = manifest::select(&manifest_bytes, &media.manifest.url, &[MediaKind::Video, MediaKind::Audio])?;
        let (Some(video), Some(audio)) = (selection.video, selection.audio) else {
            return Err(HarvestError::ManifestParse {
                url: url_hint(&media.manifest.url),
                reason: "video or audio representation missing".to_string(),
            });
        };
        info!("Selected video at {} bps", video.bitrate);

        self.fetch(&video, video_path).await?;
        self.fetch(&audio, audio_path).await
    }

    /// HLS named after the page title, fetched by the stream tool or directly
    async fn process_open(&self, identifier: &str) -> Result<IdentifierOutcome> {
        let output_dir = &self.ctx.config.output_dir;
        let media = self.ctx.resolver.resolve(identifier).await?;
        let name = media.output_name();
        if let Some(existing) = existing_output(output_dir, &name) {
            info!("{} already present at {}", identifier, existing.display());
            return Ok(IdentifierOutcome::SkippedExisting(existing));
        }

        if let Some(tool) = &self.ctx.stream_tool {
            let output = tool.download(&media, &self.ctx.auth, &self.ctx.cancel).await?;
            return Ok(IdentifierOutcome::Succeeded(output));
        }

        let manifest_bytes = self.ctx.resolver.fetch_manifest(&media.manifest).await?;
        let selection = manifest::select(&manifest_bytes, &media.manifest.url, &[MediaKind::Video])?;
        let Some(video) = selection.video else {
            return Err(HarvestError::ManifestParse {
                url: url_hint(&media.manifest.url),
                reason: "no video representation".to_string(),
            });
        };
        info!("Selected {} stream at {} bps", video.kind, video.bitrate);

        let video_path = output_dir.join(format!("{}.mp4", name));
        let video_url = self.terminal_url(&media, &video).await?;
        self.fetch_url(&video_url, &video_path).await?;

        if video.kind == MediaKind::Video {
            if let Some(audio) = selection.audio {
                let audio_path = output_dir.join(format!("{}_audio.mp4", name));
                let audio_url = self.terminal_url(&media, &audio).await?;
                self.fetch_url(&audio_url, &audio_path).await?;
                warn!("Audio for {} saved separately to {}", identifier, audio_path.display());
            }
        }
        Ok(IdentifierOutcome::Succeeded(video_path))
    }

    /// Follow a media playlist down to the single file it addresses
    async fn terminal_url(&self, media: &ResolvedMedia, representation: &Representation) -> Result<String> {
        if !hls::is_playlist_url(&representation.url) {
            return Ok(representation.url.clone());
        }
        let reference = ManifestReference {
            url: representation.url.clone(),
            token: media.manifest.token.clone(),
            referer: media.manifest.referer.clone(),
        };
        let playlist = self.ctx.resolver.fetch_manifest(&reference).await?;
        hls::single_resource(&playlist, &representation.url)?.ok_or_else(|| HarvestError::ManifestParse {
            url: url_hint(&representation.url),
            reason: "segmented playlist needs the external stream downloader (external_tool_path)".to_string(),
        })
    }

    async fn fetch(&self, representation: &Representation, destination: &Path) -> Result<()> {
        self.fetch_url(&representation.url, destination).await
    }

    /// Finished files are kept as they are
    async fn fetch_url(&self, url: &str, destination: &Path) -> Result<()> {
        if destination.exists() {
            info!("{} already downloaded", destination.display());
            return Ok(());
        }
        let task = DownloadTask::new(url, destination);
        let outcome = self
            .ctx
            .downloader
            .download(&task, self.ctx.downloader.config().chunk_concurrency, self.ctx.progress.clone())
            .await?;
        debug!("{}: {:?}", task.label, outcome);
        Ok(())
    }

    /// Persist the outcome; queue write problems are logged, never fatal
    async fn record(&self, identifier: &str, outcome: &IdentifierOutcome) {
        let result = match outcome {
            IdentifierOutcome::Succeeded(_) | IdentifierOutcome::SkippedExisting(_) => {
                self.ctx.queue.record_success(identifier).await
            }
            IdentifierOutcome::Failed(_) => self.ctx.queue.record_failure(identifier).await,
            IdentifierOutcome::Cancelled => Ok(()),
        };
        if let Err(e) = result {
            error!("Could not record outcome of {}: {}", identifier, e);
        }
    }
}

#[cfg(test)]
mod tests;
