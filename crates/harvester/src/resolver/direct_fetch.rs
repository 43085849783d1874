//! Direct page resolution for cookie-authenticated sites
//!
//! The identifier's page is fetched with the session cookie. The title comes
//! from `<title>`; the stream is the first HLS or DASH URL embedded in the
//! page, or, failing that, the playlist minted by the player start endpoint.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, COOKIE, ORIGIN, REFERER};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ApiRequester, ManifestReference, MediaMetadata, ResolvedMedia, Resolver, decode_json};
use crate::downloader::core::{HarvestError, Result, RetryPolicy};
use crate::session::AuthContext;

static TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>([^<]+)</title>").unwrap());
static SITE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*[-|]\s*nanairo.*$").unwrap());
static SITE_SUFFIX_KANA: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[-|]\s*ナナイロ.*$").unwrap());
static EMBEDDED_STREAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>\\]+?\.(?:m3u8|mpd)(?:\?[^\s"'<>\\]*)?"#).unwrap()
});

const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct PlayerStart {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<PlayerData>,
}

#[derive(Debug, Deserialize)]
struct PlayerData {
    #[serde(default, rename = "segmentToken")]
    segment_token: Option<String>,
}

pub struct DirectFetchResolver {
    requester: ApiRequester,
    site_base: String,
}

impl DirectFetchResolver {
    pub fn new(
        client: Client,
        auth: Arc<AuthContext>,
        site_base: &str,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            requester: ApiRequester { client, auth, policy, cancel },
            site_base: site_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn page_url(&self, identifier: &str) -> String {
        format!("{}/{}/videos/{}", self.site_base, self.requester.auth.language, identifier)
    }

    fn with_cookie(&self, request: RequestBuilder) -> RequestBuilder {
        match self.requester.auth.cookie() {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    async fn start_player(&self, identifier: &str) -> Result<String> {
        let url = format!("{}/player/{}/start", self.site_base, identifier);
        let referer = self.page_url(identifier);
        let body = self
            .requester
            .fetch(&url, identifier, |client| {
                self.with_cookie(client.put(&url))
                    .header(REFERER, referer.as_str())
                    .header(ORIGIN, self.site_base.as_str())
                    .header(CONTENT_TYPE, "application/json")
            })
            .await?;
        let start: PlayerStart = decode_json(&url, &body)?;

        let token = start
            .data
            .and_then(|d| d.segment_token)
            .filter(|t| start.success && !t.trim().is_empty());
        token.ok_or_else(|| HarvestError::UnexpectedResponse {
            url,
            reason: format!("player start for {} returned no segment token", identifier),
        })
    }
}

#[async_trait]
impl Resolver for DirectFetchResolver {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedMedia> {
        let page_url = self.page_url(identifier);
        let body = self
            .requester
            .fetch(&page_url, identifier, |client| self.with_cookie(client.get(&page_url)))
            .await?;
        let html = String::from_utf8_lossy(&body);

        let title = extract_title(&html);
        info!("Title of {}: {}", identifier, title.as_deref().unwrap_or(identifier));

        let manifest = match embedded_stream_url(&html) {
            Some(url) => {
                debug!("Found embedded stream URL on page of {}", identifier);
                ManifestReference::new(url)
            }
            None => {
                let token = self.start_player(identifier).await?;
                ManifestReference {
                    url: format!("{}/videos/{}/cmaf/sdr/{}/index.m3u8", self.site_base, identifier, token),
                    token: Some(token),
                    referer: None,
                }
            }
        };

        Ok(ResolvedMedia {
            identifier: identifier.to_string(),
            manifest: ManifestReference { referer: Some(page_url), ..manifest },
            metadata: MediaMetadata { title, ..MediaMetadata::default() },
        })
    }

    async fn fetch_manifest(&self, reference: &ManifestReference) -> Result<Vec<u8>> {
        self.requester
            .fetch(&reference.url, &reference.url, |client| {
                let request = self.with_cookie(client.get(&reference.url));
                match &reference.referer {
                    Some(referer) => request.header(REFERER, referer.as_str()),
                    None => request,
                }
            })
            .await
    }
}

/// Page title without the site suffix, made safe for file names
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE.captures(html)?.get(1)?.as_str().trim();
    let stripped = SITE_SUFFIX.replace(raw, "");
    let stripped = SITE_SUFFIX_KANA.replace(&stripped, "");
    let title = sanitize_file_name(&stripped);
    (!title.is_empty()).then_some(title)
}

/// Replace characters Windows rejects, trim spaces and dots, cap the length
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if r#"<>:"/\|?*"#.contains(c) { '_' } else { c })
        .collect();
    replaced
        .trim_matches(|c| c == ' ' || c == '.')
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect()
}

fn embedded_stream_url(html: &str) -> Option<String> {
    let unescaped = html.replace("\\/", "/").replace("&amp;", "&");
    EMBEDDED_STREAM.find(&unescaped).map(|m| m.as_str().to_string())
}
