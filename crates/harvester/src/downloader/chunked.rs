//! Resumable chunked transfers
//!
//! A [`ChunkedDownloader`] fetches one remote asset to one local path. Bytes
//! land in `<dest>.part` and are renamed into place only once complete, so a
//! file at the destination is a finished transfer. It is never fetched again
//! when its size matches the remote, or when the remote size cannot be learned.
//!
//! Large assets on servers that accept ranges are split into contiguous
//! sub-ranges fetched concurrently; their progress is persisted in a
//! `<dest>.part.meta` sidecar so an interrupted run resumes each sub-range
//! where it stopped.

use futures::future::join_all;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{
    DownloadMetrics, FileOperation, HarvestError, HttpClient, ProgressCallback, ProgressEvent,
    RateEstimator, RemoteInfo, Result, retry_with_backoff,
};
use crate::downloader::core::files::{
    ResumeMetadata, atomic_rename, create_meta_path, create_temp_path,
    ensure_parent_dir, existing_size, remove_if_exists, url_hint,
};

/// One asset to fetch
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    /// Short name used in progress events and logs
    pub label: String,
}

impl DownloadTask {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(url: S, destination: P) -> Self {
        let destination = destination.into();
        let label = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        Self {
            url: url.into(),
            destination,
            expected_size: None,
            label,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = label.into();
        self
    }
}

/// How a successful call got the destination into its final state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { size: u64 },
    Resumed { size: u64, resumed_from: u64 },
    /// Destination already held the expected bytes; nothing was requested
    AlreadyComplete { size: u64 },
}

impl DownloadOutcome {
    pub fn size(&self) -> u64 {
        match *self {
            DownloadOutcome::Downloaded { size }
            | DownloadOutcome::Resumed { size, .. }
            | DownloadOutcome::AlreadyComplete { size } => size,
        }
    }

    /// Bytes fetched over the network by this call
    pub fn transferred(&self) -> u64 {
        match *self {
            DownloadOutcome::Downloaded { size } => size,
            DownloadOutcome::Resumed { size, resumed_from } => size.saturating_sub(resumed_from),
            DownloadOutcome::AlreadyComplete { .. } => 0,
        }
    }
}

/// Resumable, optionally parallel HTTP downloader
#[derive(Debug, Clone)]
pub struct ChunkedDownloader {
    http: HttpClient,
    config: DownloadConfig,
    metrics: Arc<DownloadMetrics>,
    cancel: CancellationToken,
}

impl ChunkedDownloader {
    /// `client` should not negotiate compression, or byte offsets stop meaning anything
    pub fn new(client: Client, config: DownloadConfig) -> Self {
        Self {
            http: HttpClient::new(client, config.timeout),
            config,
            metrics: Arc::new(DownloadMetrics::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DownloadMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<DownloadMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetch `task` using up to `concurrency` sub-ranges
    ///
    /// Failures other than cancellation and local file errors are reported as
    /// [`HarvestError::Transfer`]. Partial bytes are kept for the next attempt.
    pub async fn download(
        &self,
        task: &DownloadTask,
        concurrency: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        self.metrics.record_download_started();
        let result = self.download_inner(task, concurrency.max(1), progress.as_ref()).await;

        match &result {
            Ok(DownloadOutcome::AlreadyComplete { size }) => {
                debug!("{} already complete ({} bytes)", task.label, size);
                self.metrics.record_already_complete();
            }
            Ok(outcome) => self.metrics.record_download_completed(outcome.transferred()),
            Err(error) => {
                self.metrics.record_download_failed();
                if !error.is_cancelled() {
                    if let Some(callback) = &progress {
                        callback(ProgressEvent::Error {
                            label: task.label.clone(),
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        result.map_err(|error| into_transfer_error(&task.url, error))
    }

    async fn download_inner(
        &self,
        task: &DownloadTask,
        concurrency: usize,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let dest = task.destination.as_path();
        ensure_parent_dir(dest).await?;

        let dest_size = existing_size(dest).await?;
        if let (Some(existing), Some(expected)) = (dest_size, task.expected_size) {
            if existing == expected {
                return Ok(DownloadOutcome::AlreadyComplete { size: existing });
            }
        }

        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled { reason: format!("{} not started", task.label) });
        }

        if !self.config.allow_resume {
            remove_if_exists(&create_temp_path(dest)).await?;
            remove_if_exists(&create_meta_path(dest)).await?;
        }

        let remote = if task.expected_size.is_none() || concurrency > 1 {
            self.probe(&task.url).await?
        } else {
            RemoteInfo::unknown()
        };
        let total = task.expected_size.or(remote.size);

        if let Some(existing) = dest_size {
            match total {
                // Destinations only appear through the final rename
                None => {
                    debug!("Remote size of {} unknown; keeping the existing {} bytes", task.label, existing);
                    return Ok(DownloadOutcome::AlreadyComplete { size: existing });
                }
                Some(total) if existing == total => {
                    return Ok(DownloadOutcome::AlreadyComplete { size: existing });
                }
                Some(total) => self.demote_mismatched_destination(dest, existing, total).await?,
            }
        }

        // A pre-sized .part from a parallel attempt stays parallel
        let partial = if existing_size(&create_meta_path(dest)).await?.is_some() {
            0
        } else {
            existing_size(&create_temp_path(dest)).await?.unwrap_or(0)
        };
        let remaining = total.map(|t| t.saturating_sub(partial));
        let parallel_total = match (total, remaining) {
            (Some(total), Some(remaining))
                if concurrency > 1 && remote.accepts_ranges && remaining >= self.config.min_parallel_size =>
            {
                Some(total)
            }
            _ => None,
        };

        match parallel_total {
            Some(total) => match self.download_parallel(task, total, concurrency, progress).await {
                Err(HarvestError::RangeIgnored { .. }) => {
                    warn!("Server ignored range requests for {}; falling back to a single stream", task.label);
                    emit_warning(progress, &task.label, "range requests ignored, downloading sequentially");
                    remove_if_exists(&create_meta_path(dest)).await?;
                    remove_if_exists(&create_temp_path(dest)).await?;
                    self.download_sequential(task, Some(total), progress).await
                }
                other => other,
            },
            None => self.download_sequential(task, total, progress).await,
        }
    }

    /// HEAD the asset; failures only cost us the size and range hints
    async fn probe(&self, url: &str) -> Result<RemoteInfo> {
        match self.http.probe(url).await {
            Ok(info) => Ok(info),
            Err(error) if error.is_cancelled() => Err(error),
            Err(error) => {
                debug!("Probe of {} failed, continuing without size: {}", url_hint(url), error);
                Ok(RemoteInfo::unknown())
            }
        }
    }

    /// A destination whose size disagrees with the remote becomes the partial file
    async fn demote_mismatched_destination(&self, dest: &Path, existing: u64, total: u64) -> Result<()> {
        let temp_path = create_temp_path(dest);
        warn!(
            "{} has {} bytes but {} expected; treating it as a partial download",
            dest.display(),
            existing,
            total
        );
        if existing < total && existing_size(&temp_path).await?.is_none() {
            remove_if_exists(&create_meta_path(dest)).await?;
            atomic_rename(dest, &temp_path).await
        } else {
            remove_if_exists(dest).await
        }
    }

    async fn download_sequential(
        &self,
        task: &DownloadTask,
        total: Option<u64>,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let dest = task.destination.as_path();
        let temp_path = create_temp_path(dest);
        let meta_path = create_meta_path(dest);

        // A sidecar means the .part was pre-sized and its length says nothing about progress
        if existing_size(&meta_path).await?.is_some() {
            remove_if_exists(&meta_path).await?;
            remove_if_exists(&temp_path).await?;
        }

        let mut initial = existing_size(&temp_path).await?.unwrap_or(0);
        if total.is_some_and(|t| initial > t) {
            warn!("Partial file for {} is larger than the asset; starting over", task.label);
            remove_if_exists(&temp_path).await?;
            initial = 0;
        }
        if initial > 0 {
            info!("Resuming {} from byte {}", task.label, initial);
            self.metrics.record_resume();
        }

        emit_started(progress, task, total, initial);
        let counter = Arc::new(AtomicU64::new(initial));
        let ticker = ProgressTicker::start(task.label.clone(), counter.clone(), total, self.config.progress_interval, progress.cloned());

        let http = &self.http;
        let metrics = &self.metrics;
        let cancel = &self.cancel;
        let temp = temp_path.as_path();
        let shared = counter.as_ref();
        let result = retry_with_backoff(&self.config.retry_policy(), &task.label, progress, cancel, move |attempt| {
            if attempt > 1 {
                metrics.record_retry();
            }
            http.fetch_sequential(&task.url, temp, total, shared, cancel)
        })
        .await;
        ticker.finish().await;

        let fetched = result?;
        if let Some(total) = total {
            if fetched.size != total {
                return Err(HarvestError::UnexpectedResponse {
                    url: task.url.clone(),
                    reason: format!("received {} of {} bytes", fetched.size, total),
                });
            }
        }

        atomic_rename(&temp_path, dest).await?;
        emit_complete(progress, task, fetched.size);

        Ok(if initial > 0 && !fetched.restarted {
            DownloadOutcome::Resumed { size: fetched.size, resumed_from: initial }
        } else {
            DownloadOutcome::Downloaded { size: fetched.size }
        })
    }

    async fn download_parallel(
        &self,
        task: &DownloadTask,
        total: u64,
        concurrency: usize,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let dest = task.destination.as_path();
        let temp_path = create_temp_path(dest);
        let meta_path = create_meta_path(dest);

        let meta = match ResumeMetadata::load(&meta_path, total).await {
            Some(meta) => meta,
            None => {
                // Only a short .part can be a single-stream prefix; a full-length one was pre-sized
                let partial = existing_size(&temp_path).await?.unwrap_or(0);
                let offset = if partial < total { partial } else { 0 };
                ResumeMetadata::split(url_hint(&task.url), offset, total, concurrency)
            }
        };

        let resumed_from = meta.bytes_done();
        if resumed_from > 0 {
            info!("Resuming {} from {}/{} bytes across {} ranges", task.label, resumed_from, total, meta.segments.len());
            self.metrics.record_resume();
        }
        meta.save(&meta_path).await?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| HarvestError::file_system(&temp_path, FileOperation::Create, e))?;
        file.set_len(total).await
            .map_err(|e| HarvestError::file_system(&temp_path, FileOperation::Resize, e))?;
        drop(file);

        emit_started(progress, task, Some(total), resumed_from);
        let run = ParallelRun {
            task,
            counters: meta.segments.iter().map(|s| AtomicU64::new(s.downloaded)).collect(),
            temp_path,
            meta_path,
            meta,
            aggregate: Arc::new(AtomicU64::new(resumed_from)),
            abort: self.cancel.child_token(),
            save_lock: Mutex::new(()),
        };
        let ticker = ProgressTicker::start(task.label.clone(), run.aggregate.clone(), Some(total), self.config.progress_interval, progress.cloned());

        let results = join_all(
            run.meta.segments
                .iter()
                .enumerate()
                .filter(|(_, segment)| !segment.is_complete())
                .map(|(index, _)| self.run_segment(&run, index, progress)),
        )
        .await;
        ticker.finish().await;

        if let Some(error) = first_meaningful_error(results) {
            run.checkpoint().await;
            return Err(error);
        }

        remove_if_exists(&run.meta_path).await?;
        atomic_rename(&run.temp_path, dest).await?;
        emit_complete(progress, task, total);

        Ok(if resumed_from > 0 {
            DownloadOutcome::Resumed { size: total, resumed_from }
        } else {
            DownloadOutcome::Downloaded { size: total }
        })
    }

    /// Fetch one sub-range; the first hard failure aborts its siblings
    async fn run_segment(&self, run: &ParallelRun<'_>, index: usize, progress: Option<&ProgressCallback>) -> Result<()> {
        let segment = &run.meta.segments[index];
        let done = &run.counters[index];
        let label = format!("{} [{}-{}]", run.task.label, segment.start, segment.end);
        let metrics = &self.metrics;
        let http = &self.http;

        let result = retry_with_backoff(&self.config.retry_policy(), &label, progress, &run.abort, move |attempt| {
            if attempt > 1 {
                metrics.record_retry();
            }
            let cursor = segment.start + done.load(Ordering::Relaxed);
            async move {
                if cursor > segment.end {
                    return Ok(());
                }
                http.fetch_segment(&run.task.url, &run.temp_path, cursor, segment.end, &run.abort, |n| {
                    done.fetch_add(n, Ordering::Relaxed);
                    run.aggregate.fetch_add(n, Ordering::Relaxed);
                })
                .await
                .map(|_| ())
            }
        })
        .await;

        match &result {
            Ok(()) => run.checkpoint().await,
            Err(error) if !error.is_cancelled() => {
                debug!("Range {} failed, aborting the others: {}", label, error);
                run.abort.cancel();
            }
            Err(_) => {}
        }
        result
    }
}

/// Shared state of one parallel transfer
struct ParallelRun<'a> {
    task: &'a DownloadTask,
    temp_path: PathBuf,
    meta_path: PathBuf,
    /// Segment layout as of the start of this run
    meta: ResumeMetadata,
    /// Bytes done per segment, indexed like `meta.segments`
    counters: Vec<AtomicU64>,
    aggregate: Arc<AtomicU64>,
    abort: CancellationToken,
    save_lock: Mutex<()>,
}

impl ParallelRun<'_> {
    fn snapshot(&self) -> ResumeMetadata {
        let mut meta = self.meta.clone();
        for (segment, done) in meta.segments.iter_mut().zip(&self.counters) {
            segment.downloaded = done.load(Ordering::Relaxed).min(segment.len());
        }
        meta
    }

    /// Persist per-segment progress; failures only cost resume precision
    async fn checkpoint(&self) {
        let _guard = self.save_lock.lock().await;
        if let Err(e) = self.snapshot().save(&self.meta_path).await {
            warn!("Could not persist resume data for {}: {}", self.task.label, e);
        }
    }
}

/// Prefer the error that caused an abort over the cancellations it produced
fn first_meaningful_error(results: Vec<Result<()>>) -> Option<HarvestError> {
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(error) if error.is_cancelled() => {
                cancelled.get_or_insert(error);
            }
            Err(error) => return Some(error),
        }
    }
    cancelled
}

fn into_transfer_error(url: &str, error: HarvestError) -> HarvestError {
    match error {
        HarvestError::Transfer { .. }
        | HarvestError::Cancelled { .. }
        | HarvestError::FileSystem { .. } => error,
        other => HarvestError::Transfer {
            url: url_hint(url),
            attempts: 1,
            last_error: other.to_string(),
        },
    }
}

fn emit_started(progress: Option<&ProgressCallback>, task: &DownloadTask, total: Option<u64>, resumed_from: u64) {
    if let Some(callback) = progress {
        callback(ProgressEvent::DownloadStarted {
            url: url_hint(&task.url),
            label: task.label.clone(),
            total_size: total,
            resumed_from,
        });
    }
}

fn emit_complete(progress: Option<&ProgressCallback>, task: &DownloadTask, final_size: u64) {
    if let Some(callback) = progress {
        callback(ProgressEvent::DownloadComplete {
            label: task.label.clone(),
            final_size,
        });
    }
}

fn emit_warning(progress: Option<&ProgressCallback>, label: &str, message: &str) {
    if let Some(callback) = progress {
        callback(ProgressEvent::Warning {
            label: label.to_string(),
            message: message.to_string(),
        });
    }
}

/// Emits a progress sample every interval until finished
struct ProgressTicker {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    fn start(
        label: String,
        counter: Arc<AtomicU64>,
        total: Option<u64>,
        interval: Duration,
        callback: Option<ProgressCallback>,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = callback.map(|callback| {
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut estimator = RateEstimator::new(counter.load(Ordering::Relaxed));
                let mut ticks = tokio::time::interval(interval.max(Duration::from_millis(1)));
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticks.tick() => {
                            let sample = estimator.observe(counter.load(Ordering::Relaxed), total);
                            callback(ProgressEvent::DownloadProgress { label: label.clone(), sample });
                        }
                    }
                }
            })
        });
        Self { stop, handle }
    }

    async fn finish(self) {
        self.stop.cancel();
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}
