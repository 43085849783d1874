//! Transfer counters shared across workers

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about transfer operations, updated with atomic counters so
/// concurrent workers can share one instance.
#[derive(Debug, Default)]
pub struct DownloadMetrics {
    pub total_bytes: AtomicU64,
    pub total_downloads: AtomicU64,
    pub successful_downloads: AtomicU64,
    pub failed_downloads: AtomicU64,
    pub resumed_downloads: AtomicU64,
    pub retries_attempted: AtomicU64,
    pub already_complete: AtomicU64,
}

impl DownloadMetrics {
    pub fn record_download_started(&self) {
        self.total_downloads.fetch_add(1, Ordering::Relaxed);
    }

    /// `transferred` counts only bytes fetched during this call
    pub fn record_download_completed(&self, transferred: u64) {
        self.successful_downloads.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(transferred, Ordering::Relaxed);
    }

    pub fn record_download_failed(&self) {
        self.failed_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resume(&self) {
        self.resumed_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Destination was already complete, nothing fetched
    pub fn record_already_complete(&self) {
        self.already_complete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DownloadMetricsSnapshot {
        DownloadMetricsSnapshot {
            total_downloads: self.total_downloads.load(Ordering::Relaxed),
            successful_downloads: self.successful_downloads.load(Ordering::Relaxed),
            failed_downloads: self.failed_downloads.load(Ordering::Relaxed),
            resumed_downloads: self.resumed_downloads.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            retries_attempted: self.retries_attempted.load(Ordering::Relaxed),
            already_complete: self.already_complete.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of download metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadMetricsSnapshot {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub resumed_downloads: u64,
    pub total_bytes: u64,
    pub retries_attempted: u64,
    pub already_complete: u64,
}

impl DownloadMetricsSnapshot {
    /// Success rate as a fraction (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_downloads == 0 {
            0.0
        } else {
            (self.successful_downloads + self.already_complete) as f64 / self.total_downloads as f64
        }
    }
}
