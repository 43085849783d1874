//! Run configuration
//!
//! `HarvesterConfig` is the JSON document read at startup. Every field has a
//! default, so an empty `{}` is a valid (if not very useful) configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::downloader::config::{DownloadConfig, DownloadConfigBuilder};
use crate::downloader::core::{FileOperation, HarvestError, Result};

pub const MGSTAGE_API_BASE: &str = "https://mgsplayer-api.mgstage.jp/api/v1";
pub const NANAIRO_SITE_BASE: &str = "https://nanairo.co";

/// Decryptor credential variables, read from the environment or `.env`
pub const USERNAME_ENV: &str = "MGS_USERNAME";
pub const PASSWORD_ENV: &str = "MGS_PASSWORD";

/// Which platform, and therefore which resolver, a run targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Search-then-detail API, MPD manifests, decryption required
    #[default]
    Mgstage,
    /// Direct page fetch, HLS manifests
    Nanairo,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Mgstage => write!(f, "mgstage"),
            Platform::Nanairo => write!(f, "nanairo"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mgstage" => Ok(Platform::Mgstage),
            "nanairo" => Ok(Platform::Nanairo),
            other => Err(HarvestError::Configuration {
                message: format!("Unknown platform '{}'", other),
                field: Some("platform".to_string()),
                suggestion: Some("Use 'mgstage' or 'nanairo'".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default)]
    pub platform: Platform,

    /// Session cookie for cookie-authenticated platforms
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default = "default_shop_id")]
    pub shop_id: String,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default = "default_player_version")]
    pub player_version: String,
    #[serde(default = "default_language")]
    pub language: String,

    /// HTTP(S) proxy applied to every request
    #[serde(default)]
    pub proxy: Option<String>,

    /// Override of the platform API base URL
    #[serde(default)]
    pub api_base: Option<String>,
    /// Override of the platform site base URL
    #[serde(default)]
    pub site_base: Option<String>,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_decrypted_dir")]
    pub decrypted_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Identifiers processed concurrently
    #[serde(default = "default_threads")]
    pub download_threads: usize,
    /// Sub-range fetches per asset
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Decryptor for mgstage, stream downloader for nanairo
    #[serde(default, alias = "jav_it_path", alias = "n_m3u8dl_path")]
    pub external_tool_path: Option<PathBuf>,
    #[serde(default, alias = "n_m3u8dl_args")]
    pub external_tool_args: Vec<String>,

    #[serde(default, alias = "mgs_username")]
    pub decrypt_username: Option<String>,
    #[serde(default, alias = "mgs_password")]
    pub decrypt_password: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub start_id: Option<u64>,
    #[serde(default)]
    pub end_id: Option<u64>,
    #[serde(default)]
    pub ids: Vec<String>,
}

fn default_shop_id() -> String {
    "prestigebb".to_string()
}

fn default_quality() -> String {
    "high".to_string()
}

fn default_player_version() -> String {
    "1.2.3".to_string()
}

fn default_language() -> String {
    "ja".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloaded")
}

fn default_decrypted_dir() -> PathBuf {
    PathBuf::from("decrypted")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_threads() -> usize {
    1
}

fn default_chunk_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("harvester.log"))
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            cookie: None,
            uid: None,
            device_id: None,
            shop_id: default_shop_id(),
            quality: default_quality(),
            player_version: default_player_version(),
            language: default_language(),
            proxy: None,
            api_base: None,
            site_base: None,
            output_dir: default_output_dir(),
            decrypted_dir: default_decrypted_dir(),
            temp_dir: default_temp_dir(),
            download_threads: default_threads(),
            chunk_concurrency: default_chunk_concurrency(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            external_tool_path: None,
            external_tool_args: Vec::new(),
            decrypt_username: None,
            decrypt_password: None,
            log_file: default_log_file(),
            start_id: None,
            end_id: None,
            ids: Vec::new(),
        }
    }
}

impl HarvesterConfig {
    /// Read the JSON document at `path`; a missing file yields the defaults
    ///
    /// Tool paths starting with `./` are resolved against the directory of
    /// the document, and decryptor credentials fall back to the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(HarvestError::file_system(path, FileOperation::Read, e)),
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative_paths(base_dir);
        config.apply_env();
        debug!("Loaded configuration for {}", config.platform);
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| HarvestError::Configuration {
            message: format!("Invalid config document: {}", e),
            field: None,
            suggestion: Some("Check the JSON syntax and field types".to_string()),
        })
    }

    pub fn resolve_relative_paths(&mut self, base_dir: &Path) {
        if let Some(tool) = &self.external_tool_path {
            let text = tool.to_string_lossy();
            if let Some(rest) = text.strip_prefix("./").or_else(|| text.strip_prefix(".\\")) {
                self.external_tool_path = Some(base_dir.join(rest));
            }
        }
    }

    /// Fill decryptor credentials from `MGS_USERNAME`/`MGS_PASSWORD`, loading `.env` first
    pub fn apply_env(&mut self) {
        dotenv::dotenv().ok();
        if self.decrypt_username.is_none() {
            self.decrypt_username = std::env::var(USERNAME_ENV).ok();
        }
        if self.decrypt_password.is_none() {
            self.decrypt_password = std::env::var(PASSWORD_ENV).ok();
        }
    }

    /// Startup checks; any error here aborts the run before work starts
    pub fn validate(&self) -> Result<()> {
        match self.platform {
            Platform::Mgstage => {
                if is_blank(&self.uid) {
                    return Err(missing_field("uid", "Copy the uid header from a logged-in player session"));
                }
                if is_blank(&self.device_id) {
                    return Err(missing_field("device_id", "Copy the device-id header from a logged-in player session"));
                }
            }
            Platform::Nanairo => {
                if is_blank(&self.cookie) {
                    warn!("No cookie configured - some videos may not be accessible");
                }
            }
        }

        if let Some(tool) = &self.external_tool_path {
            if !tool.exists() {
                return Err(HarvestError::ExternalTool {
                    tool: tool.clone(),
                    reason: "configured tool does not exist".to_string(),
                });
            }
        }

        if self.download_threads == 0 {
            return Err(HarvestError::Configuration {
                message: "download_threads must be at least 1".to_string(),
                field: Some("download_threads".to_string()),
                suggestion: None,
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or(MGSTAGE_API_BASE)
    }

    pub fn site_base(&self) -> &str {
        self.site_base.as_deref().unwrap_or(NANAIRO_SITE_BASE)
    }

    /// Transfer tuning derived from this document
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfigBuilder::new()
            .max_retries(self.max_retries)
            .timeout(self.timeout())
            .chunk_concurrency(self.chunk_concurrency.max(1))
            .progress_interval(Duration::from_millis(self.progress_interval_ms))
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .max_retry_delay(Duration::from_millis(self.max_retry_delay_ms))
            .build()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

fn missing_field(field: &str, suggestion: &str) -> HarvestError {
    HarvestError::Configuration {
        message: format!("Missing {} config", field),
        field: Some(field.to_string()),
        suggestion: Some(suggestion.to_string()),
    }
}
