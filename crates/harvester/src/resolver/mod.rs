//! Identifier → manifest resolution
//!
//! Each platform has one [`Resolver`] implementation, picked once per run by
//! [`for_platform`]:
//! - [`search_detail::SearchDetailResolver`]: search API, then a detail lookup
//! - [`direct_fetch::DirectFetchResolver`]: the identifier's page, scraped
//!
//! Both send their requests through `ApiRequester::fetch`, so transient failures
//! are retried by the shared policy while auth and not-found answers are not.

pub mod direct_fetch;
pub mod search_detail;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{HarvesterConfig, Platform};
use crate::downloader::core::{HarvestError, Result, RetryPolicy, retry_with_backoff};
use crate::session::AuthContext;

pub use direct_fetch::DirectFetchResolver;
pub use search_detail::SearchDetailResolver;

/// Short-lived handle to a manifest document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestReference {
    pub url: String,
    /// Signed playback token the URL was minted from, when the platform issues one
    pub token: Option<String>,
    /// Page the manifest must be requested from
    pub referer: Option<String>,
}

impl ManifestReference {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into(), token: None, referer: None }
    }
}

/// Descriptive metadata returned alongside the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub cast: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub identifier: String,
    pub manifest: ManifestReference,
    pub metadata: MediaMetadata,
}

impl ResolvedMedia {
    /// File stem for outputs named after the title: `<id>_<title>`, or just
    /// `<id>` when there is no distinct title
    pub fn output_name(&self) -> String {
        match self.metadata.title.as_deref() {
            Some(title) if !title.is_empty() && title != self.identifier => {
                format!("{}_{}", self.identifier, title)
            }
            _ => self.identifier.clone(),
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedMedia>;

    /// Fetch the manifest document behind a resolved reference
    async fn fetch_manifest(&self, reference: &ManifestReference) -> Result<Vec<u8>>;
}

/// Build the resolver for the configured platform
pub fn for_platform(
    config: &HarvesterConfig,
    auth: Arc<AuthContext>,
    cancel: CancellationToken,
) -> Result<Arc<dyn Resolver>> {
    let client = auth.api_client()?;
    let policy = config.download_config().retry_policy();
    let resolver: Arc<dyn Resolver> = match config.platform {
        Platform::Mgstage => Arc::new(SearchDetailResolver::new(
            client,
            auth,
            config.api_base(),
            policy,
            cancel,
        )),
        Platform::Nanairo => Arc::new(DirectFetchResolver::new(
            client,
            auth,
            config.site_base(),
            policy,
            cancel,
        )),
    };
    Ok(resolver)
}

/// Request plumbing shared by both resolvers
#[derive(Clone)]
pub(crate) struct ApiRequester {
    pub client: Client,
    pub auth: Arc<AuthContext>,
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
}

impl ApiRequester {
    /// Send the request built by `build` and read its body, retrying transient failures
    ///
    /// Statuses map through [`HarvestError::from_status`], so 401/403 become
    /// `Auth` and 404 becomes `NotFound` for `identifier`.
    pub async fn fetch<F>(&self, url: &str, identifier: &str, build: F) -> Result<Vec<u8>>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let timeout_secs = self.auth.timeout.as_secs();
        retry_with_backoff(&self.policy, url, None, &self.cancel, |attempt| {
            let request = build(&self.client);
            let cancel = self.cancel.clone();
            async move {
                debug!("Requesting {} (attempt {})", crate::downloader::core::files::url_hint(url), attempt);
                let exchange = async {
                    let response = request
                        .send()
                        .await
                        .map_err(|e| HarvestError::from_reqwest(url, e, timeout_secs))?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(HarvestError::from_status(url, status, Some(identifier)));
                    }
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| HarvestError::from_reqwest(url, e, timeout_secs))?;
                    Ok(body.to_vec())
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(HarvestError::Cancelled {
                        reason: format!("request for {} aborted", identifier),
                    }),
                    result = exchange => result,
                }
            }
        })
        .await
    }
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(url: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| HarvestError::UnexpectedResponse {
        url: url.to_string(),
        reason: format!("invalid JSON: {}", e),
    })
}
