//! Whole-run tests against a mock platform

use super::*;
use crate::config::Platform;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Workspace {
    dir: TempDir,
    pending: PathBuf,
    failures: PathBuf,
}

impl Workspace {
    fn new(ids: &[&str]) -> Self {
        let dir = tempdir().unwrap();
        let pending = dir.path().join("ids.txt");
        std::fs::write(&pending, ids.join("\n") + "\n").unwrap();
        let failures = dir.path().join("failed_ids.txt");
        Self { dir, pending, failures }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn config(&self, platform: Platform, server: &MockServer) -> HarvesterConfig {
        HarvesterConfig {
            platform,
            uid: Some("user-1".into()),
            device_id: Some("device-9".into()),
            api_base: Some(server.uri()),
            site_base: Some(server.uri()),
            output_dir: self.path("downloaded"),
            decrypted_dir: self.path("decrypted"),
            temp_dir: self.path("temp"),
            download_threads: 2,
            chunk_concurrency: 1,
            timeout_secs: 5,
            max_retries: 1,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            progress_interval_ms: 10,
            log_file: None,
            ..HarvesterConfig::default()
        }
    }

    fn lines(&self, path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn orchestrator(&self, config: HarvesterConfig, cancel: CancellationToken) -> Orchestrator {
        let source = IdentifierSource::ListFile(self.pending.clone());
        let ctx = RunContext::build(config, &source, self.failures.clone(), cancel).await.unwrap();
        Orchestrator::new(ctx)
    }

    async fn run(&self, config: HarvesterConfig) -> RunSummary {
        let orchestrator = self.orchestrator(config, CancellationToken::new()).await;
        let ids = IdentifierSource::ListFile(self.pending.clone()).identifiers().await.unwrap();
        orchestrator.run(ids).await
    }
}

async fn mount_asset(server: &MockServer, route: &str, body: &[u8]) {
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).append_header("content-length", body.len().to_string().as_str()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

async fn mount_nanairo_video(server: &MockServer, id: &str, body: &[u8]) {
    let page = format!(
        "<html><head><title>Summer Story | nanairo</title></head>\
         <body><script>var src = \"{}/hls/{}/master.m3u8\";</script></body></html>",
        server.uri(),
        id
    );
    Mock::given(method("GET"))
        .and(path(format!("/ja/videos/{}", id)))
        .respond_with(ResponseTemplate::new(200).set_body_string(page))
        .mount(server)
        .await;

    let master = format!("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=4000\n/media/{}_4000.mp4\n", id);
    Mock::given(method("GET"))
        .and(path(format!("/hls/{}/master.m3u8", id)))
        .respond_with(ResponseTemplate::new(200).set_body_string(master))
        .mount(server)
        .await;
    mount_asset(server, &format!("/media/{}_4000.mp4", id), body).await;
}

async fn mount_mgstage_title(server: &MockServer, id: &str) {
    Mock::given(method("GET"))
        .and(path("/list/monthly/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "hits": 1,
            "contents": [{"pid": format!("118{}", id), "product_id": id}],
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/detail/play/monthly/content"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "manifest_url": format!("{}/manifest/{}.mpd?Policy=p", server.uri(), id),
            "title": "Title",
        })))
        .mount(server)
        .await;

    let mpd = format!(
        r#"<?xml version="1.0"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation><BaseURL><![CDATA[{base}/media/{id}_2000.mp4]]></BaseURL></Representation>
      <Representation><BaseURL><![CDATA[{base}/media/{id}_6000.mp4]]></BaseURL></Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4">
      <Representation><BaseURL><![CDATA[{base}/media/{id}_audio.mp4]]></BaseURL></Representation>
    </AdaptationSet>
  </Period>
</MPD>"#,
        base = server.uri(),
        id = id
    );
    Mock::given(method("GET"))
        .and(path(format!("/manifest/{}.mpd", id)))
        .respond_with(ResponseTemplate::new(200).set_body_string(mpd))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_title_downloads_into_output_dir_and_leaves_pending_list() {
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    mount_nanairo_video(&server, "5950", &body).await;
    Mock::given(method("GET"))
        .and(path("/ja/videos/404"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let ws = Workspace::new(&["404", "5950"]);
    let summary = ws.run(ws.config(Platform::Nanairo, &server)).await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    let output = ws.path("downloaded").join("5950_Summer Story.mp4");
    assert_eq!(std::fs::read(&output).unwrap(), body);
    assert_eq!(ws.lines(&ws.pending), vec!["404"]);
    assert_eq!(ws.lines(&ws.failures), vec!["404"]);
}

#[tokio::test]
async fn test_exhausted_transfer_is_recorded_as_failure() {
    let server = MockServer::start().await;
    mount_mgstage_title(&server, "ABF-249").await;
    Mock::given(method("GET"))
        .and(path("/media/ABF-249_6000.mp4"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ws = Workspace::new(&["ABF-249"]);
    let summary = ws.run(ws.config(Platform::Mgstage, &server)).await;

    assert_eq!(summary.failed, 1);
    assert!(summary.failures[0].1.contains("attempt"));
    assert_eq!(ws.lines(&ws.failures), vec!["ABF-249"]);
    assert_eq!(ws.lines(&ws.pending), vec!["ABF-249"]);

    let video_gets = server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET" && r.url.path() == "/media/ABF-249_6000.mp4")
        .count();
    assert_eq!(video_gets, 2);
}

#[tokio::test]
async fn test_rerun_keeps_downloaded_assets_when_size_is_unknown() {
    let server = MockServer::start().await;
    mount_mgstage_title(&server, "ABF-249").await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ABF-249_6000.mp4"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ABF-249_audio.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio-bytes".to_vec()))
        .mount(&server)
        .await;

    let ws = Workspace::new(&["ABF-249"]);
    let video = ws.path("downloaded/ABF-249_video.mp4");
    std::fs::create_dir_all(video.parent().unwrap()).unwrap();
    std::fs::write(&video, b"video-from-last-run").unwrap();

    let summary = ws.run(ws.config(Platform::Mgstage, &server)).await;
    assert_eq!(summary.succeeded, 1, "{:?}", summary.failures);
    assert_eq!(std::fs::read(&video).unwrap(), b"video-from-last-run");
    assert_eq!(std::fs::read(ws.path("downloaded/ABF-249_audio.mp4")).unwrap(), b"audio-bytes");

    let media_gets = |requests: Vec<wiremock::Request>| {
        requests
            .into_iter()
            .filter(|r| r.method.as_str() == "GET" && r.url.path().starts_with("/media/"))
            .count()
    };
    assert_eq!(media_gets(server.received_requests().await.unwrap_or_default()), 1);

    // Both assets present: the second pass goes nowhere near the network
    let before = server.received_requests().await.unwrap_or_default().len();
    let orchestrator = ws.orchestrator(ws.config(Platform::Mgstage, &server), CancellationToken::new()).await;
    let again = orchestrator.run(vec!["ABF-249".into()]).await;
    assert_eq!(again.succeeded, 1);
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), before);
    assert_eq!(std::fs::read(&video).unwrap(), b"video-from-last-run");
}

#[tokio::test]
async fn test_existing_decrypted_output_skips_all_requests() {
    let server = MockServer::start().await;
    let ws = Workspace::new(&["ABF-249", "KIT-012"]);
    std::fs::create_dir_all(ws.path("decrypted")).unwrap();
    std::fs::write(ws.path("decrypted").join("ABF-249.mkv"), b"done").unwrap();
    std::fs::write(ws.path("decrypted").join("KIT-012.mkv"), b"done").unwrap();

    let summary = ws.run(ws.config(Platform::Mgstage, &server)).await;

    assert_eq!(summary.skipped_existing, 2);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    assert!(ws.lines(&ws.pending).is_empty());
}

#[tokio::test]
async fn test_cancelled_run_records_nothing() {
    let server = MockServer::start().await;
    let ws = Workspace::new(&["5950", "5951"]);
    let cancel = CancellationToken::new();
    let orchestrator = ws.orchestrator(ws.config(Platform::Nanairo, &server), cancel.clone()).await;
    cancel.cancel();

    let summary = orchestrator.run(vec!["5950".into(), "5951".into()]).await;

    assert_eq!(summary.cancelled, 2);
    assert_eq!(ws.lines(&ws.pending), vec!["5950", "5951"]);
    assert!(ws.lines(&ws.failures).is_empty());
}

#[tokio::test]
async fn test_missing_device_identity_fails_setup() {
    let server = MockServer::start().await;
    let ws = Workspace::new(&["ABF-249"]);
    let config = HarvesterConfig { uid: None, ..ws.config(Platform::Mgstage, &server) };

    let source = IdentifierSource::ListFile(ws.pending.clone());
    let err = RunContext::build(config, &source, ws.failures.clone(), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(err.is_setup_error());
}

#[cfg(unix)]
#[tokio::test]
async fn test_protected_title_is_downloaded_and_decrypted() {
    use std::os::unix::fs::PermissionsExt;

    let server = MockServer::start().await;
    mount_mgstage_title(&server, "ABF-249").await;
    mount_asset(&server, "/media/ABF-249_6000.mp4", b"video-bytes").await;
    mount_asset(&server, "/media/ABF-249_audio.mp4", b"audio-bytes").await;

    let ws = Workspace::new(&["abf-249"]);
    let tool = ws.path("tools/jav-it");
    std::fs::create_dir_all(tool.parent().unwrap()).unwrap();
    std::fs::write(&tool, "#!/bin/sh\ncat \"$3\" > \"$5\"\n").unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = HarvesterConfig {
        external_tool_path: Some(tool),
        ..ws.config(Platform::Mgstage, &server)
    };
    let summary = ws.run(config).await;

    assert_eq!(summary.succeeded, 1, "{:?}", summary.failures);
    assert_eq!(std::fs::read(ws.path("downloaded/ABF-249_video.mp4")).unwrap(), b"video-bytes");
    assert_eq!(std::fs::read(ws.path("downloaded/ABF-249_audio.mp4")).unwrap(), b"audio-bytes");
    assert_eq!(std::fs::read(ws.path("decrypted/ABF-249.mkv")).unwrap(), b"video-bytes");
    assert!(ws.lines(&ws.pending).is_empty());
    assert!(ws.lines(&ws.failures).is_empty());
}
