//! Core types used throughout the transfer system
//!
//! Errors, progress reporting, retry policy, file helpers and counters. Every
//! other module in the crate builds on these.

pub mod error;
pub mod files;
pub mod http;
pub mod metrics;
pub mod progress;
pub mod retry;

pub use error::{ErrorSeverity, FileOperation, HarvestError, Result};
pub use http::{HttpClient, RemoteInfo};
pub use metrics::{DownloadMetrics, DownloadMetricsSnapshot};
pub use progress::{
    IntoProgressCallback, NullProgressReporter, ProgressCallback, ProgressEvent, ProgressReporter,
    ProgressSample, RateEstimator, TracingProgressReporter,
};
pub use retry::{RetryDecision, RetryPolicy, retry_with_backoff};
