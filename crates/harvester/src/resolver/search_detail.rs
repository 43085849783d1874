//! Search-then-detail resolution for the player API
//!
//! The identifier is looked up with the monthly search endpoint; the matching
//! content's `pid` is then passed to the play-detail endpoint, which returns
//! the signed MPD URL and metadata. Every call carries the device headers.

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ApiRequester, ManifestReference, MediaMetadata, ResolvedMedia, Resolver, decode_json};
use crate::downloader::core::{HarvestError, Result, RetryPolicy};
use crate::session::AuthContext;

const SEARCH_PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: u64,
    #[serde(default)]
    contents: Vec<SearchHit>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchHit {
    #[serde(default)]
    pid: String,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

impl SearchHit {
    fn matches(&self, identifier: &str) -> bool {
        self.pid.eq_ignore_ascii_case(identifier)
            || self.product_id.as_deref().is_some_and(|p| p.eq_ignore_ascii_case(identifier))
    }
}

#[derive(Debug, Deserialize)]
struct PlayInfo {
    #[serde(default)]
    manifest_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    title: Option<String>,
    #[serde(default, alias = "actress", alias = "actresses", deserialize_with = "lenient_names")]
    cast: Vec<String>,
    #[serde(default, alias = "genre", alias = "genres", deserialize_with = "lenient_names")]
    tags: Vec<String>,
}

/// Metadata is decorative: a value of the wrong shape becomes `None`
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_str().map(str::to_string)))
}

/// Name lists hold bare strings or objects with a `name` (or `*_name`) field;
/// `null`, non-lists and unnamed entries are dropped
fn lenient_names<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    let Some(Value::Array(entries)) = Option::<Value>::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(entries.into_iter().filter_map(entry_name).collect())
}

fn entry_name(entry: Value) -> Option<String> {
    let name = match &entry {
        Value::String(name) => Some(name.as_str()),
        Value::Object(fields) => fields
            .get("name")
            .or_else(|| fields.iter().find(|(key, _)| key.ends_with("_name")).map(|(_, v)| v))
            .and_then(Value::as_str),
        _ => None,
    }?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub struct SearchDetailResolver {
    requester: ApiRequester,
    api_base: String,
}

impl SearchDetailResolver {
    pub fn new(
        client: Client,
        auth: Arc<AuthContext>,
        api_base: &str,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            requester: ApiRequester { client, auth, policy, cancel },
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn search(&self, identifier: &str) -> Result<SearchHit> {
        let url = format!("{}/list/monthly/search", self.api_base);
        let auth = &self.requester.auth;
        let body = self
            .requester
            .fetch(&url, identifier, |client| {
                client
                    .get(&url)
                    .headers(auth.device_headers(Local::now()))
                    .query(&[
                        ("word", identifier),
                        ("size", SEARCH_PAGE_SIZE),
                        ("offset", "0"),
                        ("sort", "new"),
                        ("shop_id", auth.shop_id.as_str()),
                    ])
            })
            .await?;
        let response: SearchResponse = decode_json(&url, &body)?;

        if response.hits == 0 || response.contents.is_empty() {
            return Err(HarvestError::NotFound { identifier: identifier.to_string() });
        }

        let hit = match response.contents.iter().find(|hit| hit.matches(identifier)) {
            Some(hit) => hit.clone(),
            None => {
                warn!("No exact search match for {}, using first of {} hits", identifier, response.hits);
                response.contents[0].clone()
            }
        };
        if hit.pid.is_empty() {
            return Err(HarvestError::UnexpectedResponse {
                url,
                reason: format!("search hit for {} has no pid", identifier),
            });
        }
        info!("Found {} -> pid {}", identifier, hit.pid);
        Ok(hit)
    }

    async fn play_info(&self, identifier: &str, pid: &str) -> Result<PlayInfo> {
        let url = format!("{}/detail/play/monthly/content", self.api_base);
        let auth = &self.requester.auth;
        let body = self
            .requester
            .fetch(&url, identifier, |client| {
                client
                    .get(&url)
                    .headers(auth.device_headers(Local::now()))
                    .header("pid", pid)
                    .header("quality", auth.quality.as_str())
            })
            .await?;
        decode_json(&url, &body)
    }
}

#[async_trait]
impl Resolver for SearchDetailResolver {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedMedia> {
        let hit = self.search(identifier).await?;
        let info = self.play_info(identifier, &hit.pid).await?;

        let manifest_url = match info.manifest_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => url,
            None => {
                return Err(HarvestError::UnexpectedResponse {
                    url: format!("{}/detail/play/monthly/content", self.api_base),
                    reason: format!("no manifest_url for pid {}", hit.pid),
                });
            }
        };
        debug!("Manifest for {}: {}", identifier, crate::downloader::core::files::url_hint(&manifest_url));

        Ok(ResolvedMedia {
            identifier: identifier.to_string(),
            manifest: ManifestReference::new(manifest_url),
            metadata: MediaMetadata {
                title: info.title.or(hit.title),
                cast: info.cast,
                tags: info.tags,
            },
        })
    }

    async fn fetch_manifest(&self, reference: &ManifestReference) -> Result<Vec<u8>> {
        self.requester
            .fetch(&reference.url, &reference.url, |client| client.get(&reference.url))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarvesterConfig;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver(server: &MockServer) -> SearchDetailResolver {
        let config = HarvesterConfig {
            uid: Some("user-1".into()),
            device_id: Some("device-9".into()),
            timeout_secs: 5,
            ..HarvesterConfig::default()
        };
        let auth = Arc::new(AuthContext::from_config(&config));
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
        SearchDetailResolver::new(
            auth.api_client().unwrap(),
            auth,
            &server.uri(),
            policy,
            CancellationToken::new(),
        )
    }

    async fn mount_detail(server: &MockServer, pid: &str) {
        Mock::given(method("GET"))
            .and(path("/detail/play/monthly/content"))
            .and(header("pid", pid))
            .and(header("quality", "high"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "manifest_url": "https://cdn.example.com/ABF-249/manifest.mpd?Policy=p&Signature=s",
                "title": "Detail title",
                "actress": [{"name": "Performer A"}, "Performer B"],
                "genre": ["drama"],
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_search_then_detail_returns_signed_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/monthly/search"))
            .and(query_param("word", "abf-249"))
            .and(query_param("shop_id", "prestigebb"))
            .and(header("uid", "user-1"))
            .and(header("device-id", "device-9"))
            .and(header("player-type", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": 2,
                "contents": [
                    {"pid": "118ABF-2490", "title": "Other"},
                    {"pid": "118ABF-249", "product_id": "ABF-249", "title": "Search title"},
                ],
            })))
            .mount(&server)
            .await;
        mount_detail(&server, "118ABF-249").await;

        let media = resolver(&server).resolve("abf-249").await.unwrap();
        assert_eq!(media.identifier, "abf-249");
        assert_eq!(media.manifest.url, "https://cdn.example.com/ABF-249/manifest.mpd?Policy=p&Signature=s");
        assert_eq!(media.metadata.title.as_deref(), Some("Detail title"));
        assert_eq!(media.metadata.cast, vec!["Performer A", "Performer B"]);
        assert_eq!(media.metadata.tags, vec!["drama"]);
    }

    #[tokio::test]
    async fn test_zero_hits_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/monthly/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"hits": 0, "contents": []})))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve("NOPE-001").await.unwrap_err();
        assert!(matches!(err, HarvestError::NotFound { ref identifier } if identifier == "NOPE-001"));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/monthly/search"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = resolver(&server).resolve("ABF-249").await.unwrap_err();
        assert!(matches!(err, HarvestError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/monthly/search"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/list/monthly/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": 1,
                "contents": [{"pid": "118ABF-249"}],
            })))
            .mount(&server)
            .await;
        mount_detail(&server, "118ABF-249").await;

        let media = resolver(&server).resolve("ABF-249").await.unwrap();
        assert!(media.manifest.url.ends_with("manifest.mpd?Policy=p&Signature=s"));
    }

    #[test]
    fn test_odd_metadata_does_not_hide_the_manifest() {
        let info: PlayInfo = serde_json::from_value(serde_json::json!({
            "manifest_url": "https://cdn.example.com/m.mpd",
            "title": 42,
            "actresses": null,
            "genre": [{"id": 3, "genre_name": "drama"}, {"id": 4}, 7, " ", "idol"],
        }))
        .unwrap();

        assert_eq!(info.manifest_url.as_deref(), Some("https://cdn.example.com/m.mpd"));
        assert_eq!(info.title, None);
        assert!(info.cast.is_empty());
        assert_eq!(info.tags, vec!["drama", "idol"]);

        let info: PlayInfo = serde_json::from_value(serde_json::json!({
            "manifest_url": "https://cdn.example.com/m.mpd",
            "actress": [{"id": 3, "actress_name": "Performer C"}],
            "genre": "drama",
        }))
        .unwrap();
        assert_eq!(info.cast, vec!["Performer C"]);
        assert!(info.tags.is_empty());
    }

    #[tokio::test]
    async fn test_detail_without_manifest_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/monthly/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": 1,
                "contents": [{"pid": "118ABF-249"}],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/detail/play/monthly/content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"title": "x"})))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve("ABF-249").await.unwrap_err();
        assert!(matches!(err, HarvestError::UnexpectedResponse { .. }));
    }
}
