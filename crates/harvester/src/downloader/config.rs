//! Configuration types for the downloader

use std::time::Duration;

use crate::downloader::core::retry::RetryPolicy;

/// Browser-like user agent the platforms expect
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

/// Configuration for transfer operations
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_retries: usize,
    pub timeout: Duration,
    pub allow_resume: bool,
    /// Number of sub-ranges fetched concurrently for one asset
    pub chunk_concurrency: usize,
    /// Assets smaller than this are always fetched sequentially
    pub min_parallel_size: u64,
    /// Minimum time between two progress samples
    pub progress_interval: Duration,
    /// Initial delay between retries (doubles each retry)
    pub retry_delay: Duration,
    /// Maximum retry delay cap (prevents exponential backoff from getting too long)
    pub max_retry_delay: Duration,
}

impl DownloadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(30),
            allow_resume: true,
            chunk_concurrency: 4,
            min_parallel_size: 4 * 1024 * 1024,
            progress_interval: Duration::from_millis(500),
            retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Builder for [`DownloadConfig`]
#[derive(Debug, Default)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn allow_resume(mut self, allow_resume: bool) -> Self {
        self.config.allow_resume = allow_resume;
        self
    }

    pub fn chunk_concurrency(mut self, chunk_concurrency: usize) -> Self {
        self.config.chunk_concurrency = chunk_concurrency.max(1);
        self
    }

    pub fn min_parallel_size(mut self, min_parallel_size: u64) -> Self {
        self.config.min_parallel_size = min_parallel_size;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    pub fn build(self) -> DownloadConfig {
        self.config
    }
}
