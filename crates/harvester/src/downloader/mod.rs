//! Downloader module
//!
//! Core types, configuration and the resumable chunked transfer engine.

pub mod chunked;
pub mod config;
pub mod core;

pub use chunked::{ChunkedDownloader, DownloadOutcome, DownloadTask};
pub use config::{DEFAULT_USER_AGENT, DownloadConfig, DownloadConfigBuilder};
pub use core::{
    DownloadMetrics, DownloadMetricsSnapshot, ErrorSeverity, FileOperation, HarvestError,
    IntoProgressCallback, NullProgressReporter, ProgressCallback, ProgressEvent, ProgressReporter,
    ProgressSample, Result, RetryPolicy, TracingProgressReporter,
};
