//! Progress tracking and reporting for transfer operations

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Progress callback for transfer operations
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Weight of the newest interval in the smoothed rate
const RATE_SMOOTHING: f64 = 0.3;

/// A point-in-time view of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    /// Cumulative bytes present for the asset, including resumed bytes
    pub bytes: u64,
    /// Expected total size, when known
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Smoothed transfer rate in bytes per second
    pub rate_bps: f64,
}

impl ProgressSample {
    /// Remaining time at the current smoothed rate; `None` when the rate is zero or total unknown
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        if self.rate_bps <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes);
        Some(Duration::from_secs_f64(remaining as f64 / self.rate_bps))
    }

    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.bytes as f64 / total as f64 * 100.0),
        }
    }
}

/// Turns a stream of cumulative byte counts into smoothed samples
#[derive(Debug)]
pub struct RateEstimator {
    started: Instant,
    last_at: Instant,
    last_bytes: u64,
    smoothed: Option<f64>,
}

impl RateEstimator {
    pub fn new(initial_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_at: now,
            last_bytes: initial_bytes,
            smoothed: None,
        }
    }

    /// Record the cumulative byte count observed at `now`
    pub fn observe_at(&mut self, bytes: u64, total: Option<u64>, now: Instant) -> ProgressSample {
        let interval = now.duration_since(self.last_at).as_secs_f64();
        if interval > 0.0 {
            let instant_rate = bytes.saturating_sub(self.last_bytes) as f64 / interval;
            self.smoothed = Some(match self.smoothed {
                Some(previous) => RATE_SMOOTHING * instant_rate + (1.0 - RATE_SMOOTHING) * previous,
                None => instant_rate,
            });
            self.last_at = now;
            self.last_bytes = bytes;
        }

        ProgressSample {
            bytes,
            total,
            elapsed: now.duration_since(self.started),
            rate_bps: self.smoothed.unwrap_or(0.0),
        }
    }

    pub fn observe(&mut self, bytes: u64, total: Option<u64>) -> ProgressSample {
        self.observe_at(bytes, total, Instant::now())
    }
}

/// Events emitted during transfer operations
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    DownloadStarted {
        url: String,
        label: String,
        total_size: Option<u64>,
        resumed_from: u64,
    },
    DownloadProgress {
        label: String,
        sample: ProgressSample,
    },
    DownloadComplete {
        label: String,
        final_size: u64,
    },
    RetryAttempt {
        label: String,
        attempt: usize,
        max_attempts: usize,
    },
    Warning {
        label: String,
        message: String,
    },
    Error {
        label: String,
        error: String,
    },
}

/// Trait for progress reporting with more granular control
pub trait ProgressReporter: Send + Sync {
    fn on_download_started(&self, _url: &str, _label: &str, _total_size: Option<u64>, _resumed_from: u64) {}
    fn on_download_progress(&self, _label: &str, _sample: &ProgressSample) {}
    fn on_download_complete(&self, _label: &str, _final_size: u64) {}
    fn on_retry_attempt(&self, _label: &str, _attempt: usize, _max_attempts: usize) {}
    fn on_warning(&self, _label: &str, _message: &str) {}
    fn on_error(&self, _label: &str, _error: &str) {}
}

/// Extension trait to convert ProgressReporter to ProgressCallback
pub trait IntoProgressCallback {
    fn into_callback(self) -> ProgressCallback;
}

impl<T: ProgressReporter + 'static> IntoProgressCallback for T {
    fn into_callback(self) -> ProgressCallback {
        Arc::new(move |event| match event {
            ProgressEvent::DownloadStarted { url, label, total_size, resumed_from } => {
                self.on_download_started(&url, &label, total_size, resumed_from);
            }
            ProgressEvent::DownloadProgress { label, sample } => {
                self.on_download_progress(&label, &sample);
            }
            ProgressEvent::DownloadComplete { label, final_size } => {
                self.on_download_complete(&label, final_size);
            }
            ProgressEvent::RetryAttempt { label, attempt, max_attempts } => {
                self.on_retry_attempt(&label, attempt, max_attempts);
            }
            ProgressEvent::Warning { label, message } => {
                self.on_warning(&label, &message);
            }
            ProgressEvent::Error { label, error } => {
                self.on_error(&label, &error);
            }
        })
    }
}

/// Progress reporter that writes through `tracing`
#[derive(Debug, Default)]
pub struct TracingProgressReporter;

impl ProgressReporter for TracingProgressReporter {
    fn on_download_started(&self, _url: &str, label: &str, total_size: Option<u64>, resumed_from: u64) {
        match (total_size, resumed_from) {
            (Some(size), 0) => info!("Starting download: {} ({:.1} MB)", label, size as f64 / 1_048_576.0),
            (Some(size), from) => info!("Resuming download: {} at {}/{} bytes", label, from, size),
            (None, _) => info!("Starting download: {}", label),
        }
    }

    fn on_download_progress(&self, label: &str, sample: &ProgressSample) {
        let speed_mb = sample.rate_bps / 1_048_576.0;
        let eta = sample.eta()
            .map(|eta| format!("{}s", eta.as_secs()))
            .unwrap_or_else(|| "unknown".to_string());
        match sample.percent() {
            Some(percent) => info!("{}: {:.1}% ({:.1} MB/s, ETA {})", label, percent, speed_mb, eta),
            None => info!("{}: {} bytes ({:.1} MB/s)", label, sample.bytes, speed_mb),
        }
    }

    fn on_download_complete(&self, label: &str, final_size: u64) {
        info!("Download complete: {} ({} bytes)", label, final_size);
    }

    fn on_retry_attempt(&self, label: &str, attempt: usize, max_attempts: usize) {
        warn!("Retry {}/{} for: {}", attempt, max_attempts, label);
    }

    fn on_warning(&self, label: &str, message: &str) {
        warn!("{}: {}", label, message);
    }

    fn on_error(&self, label: &str, error: &str) {
        warn!("Error downloading {}: {}", label, error);
    }
}

/// Null progress reporter that does nothing
#[derive(Debug, Default)]
pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {}
