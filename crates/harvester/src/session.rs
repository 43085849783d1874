//! Per-run credentials and HTTP client construction
//!
//! An [`AuthContext`] is built once from the configuration and shared
//! read-only by every worker. It knows how to build the two kinds of client a
//! run needs: an API client for JSON/HTML lookups and a download client that
//! never negotiates compression, so byte ranges address the raw asset.

use chrono::{DateTime, Local};
use reqwest::header::{ACCEPT_ENCODING, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use std::fmt;
use std::time::Duration;

use crate::config::{HarvesterConfig, Platform};
use crate::downloader::config::DEFAULT_USER_AGENT;
use crate::downloader::core::{HarvestError, Result};

/// Credential material for one platform
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Browser session cookie
    Cookie(String),
    /// Player identity sent as request headers
    Device { uid: String, device_id: String },
    Anonymous,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Cookie(_) => f.write_str("Cookie(<redacted>)"),
            Credentials::Device { .. } => f.write_str("Device(<redacted>)"),
            Credentials::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Immutable per-run bundle of credentials, proxy and locale selectors
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub credentials: Credentials,
    pub proxy: Option<String>,
    pub language: String,
    pub shop_id: String,
    pub quality: String,
    pub player_version: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl AuthContext {
    pub fn from_config(config: &HarvesterConfig) -> Self {
        let credentials = match config.platform {
            Platform::Mgstage => match (&config.uid, &config.device_id) {
                (Some(uid), Some(device_id)) => Credentials::Device {
                    uid: uid.clone(),
                    device_id: device_id.clone(),
                },
                _ => Credentials::Anonymous,
            },
            Platform::Nanairo => match config.cookie.as_deref().map(str::trim) {
                Some(cookie) if !cookie.is_empty() => Credentials::Cookie(cookie.to_string()),
                _ => Credentials::Anonymous,
            },
        };

        Self {
            credentials,
            proxy: config.proxy.clone().filter(|p| !p.trim().is_empty()),
            language: config.language.clone(),
            shop_id: config.shop_id.clone(),
            quality: config.quality.clone(),
            player_version: config.player_version.clone(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: config.timeout(),
        }
    }

    pub fn cookie(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::Cookie(cookie) => Some(cookie),
            _ => None,
        }
    }

    /// Client for API calls and page fetches
    pub fn api_client(&self) -> Result<Client> {
        self.client_builder()?
            .build()
            .map_err(|e| client_error("api", e))
    }

    /// Client for asset transfers, requesting identity encoding
    pub fn download_client(&self) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        self.client_builder()?
            .no_gzip()
            .no_brotli()
            .default_headers(headers)
            .build()
            .map_err(|e| client_error("download", e))
    }

    fn client_builder(&self) -> Result<reqwest::ClientBuilder> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .connect_timeout(self.timeout);

        if let Some(proxy) = &self.proxy {
            let proxy = Proxy::all(proxy).map_err(|e| HarvestError::Configuration {
                message: format!("Invalid proxy URL: {}", e),
                field: Some("proxy".to_string()),
                suggestion: Some("Use a URL such as http://127.0.0.1:7890".to_string()),
            })?;
            builder = builder.proxy(proxy);
        }
        Ok(builder)
    }

    /// Identity headers the player API expects on every request
    ///
    /// `last-update` is the local time of the request as `YYYYMMDDhhmmss`.
    pub fn device_headers(&self, now: DateTime<Local>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Credentials::Device { uid, device_id } = &self.credentials {
            insert_header(&mut headers, "uid", uid);
            insert_header(&mut headers, "device-id", device_id);
        }
        insert_header(&mut headers, "player-version", &self.player_version);
        insert_header(&mut headers, "last-update", &now.format("%Y%m%d%H%M%S").to_string());
        insert_header(&mut headers, "player-type", "1");
        headers
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn client_error(kind: &str, error: reqwest::Error) -> HarvestError {
    HarvestError::Configuration {
        message: format!("Failed to create {} HTTP client: {}", kind, error),
        field: None,
        suggestion: None,
    }
}
