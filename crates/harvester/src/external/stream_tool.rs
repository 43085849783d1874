//! Segmented stream downloader (N_m3u8DL-RE command line)
//!
//! The tool only takes request headers as `-H` arguments, so the session
//! cookie is visible in the process list of the local machine while it runs.
//! Logged command lines have it redacted.

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{ToolCommand, absolute};
use crate::config::HarvesterConfig;
use crate::downloader::core::{HarvestError, Result};
use crate::resolver::ResolvedMedia;
use crate::session::AuthContext;

/// Extensions the tool may leave behind after muxing
pub const OUTPUT_EXTENSIONS: &[&str] = &["mp4", "mkv", "ts"];

#[derive(Debug, Clone)]
pub struct StreamTool {
    tool: PathBuf,
    output_dir: PathBuf,
    extra_args: Vec<String>,
}

impl StreamTool {
    pub fn new<P: Into<PathBuf>>(tool: P, config: &HarvesterConfig) -> Self {
        Self {
            tool: tool.into(),
            output_dir: config.output_dir.clone(),
            extra_args: config.external_tool_args.clone(),
        }
    }

    pub fn command(&self, media: &ResolvedMedia, auth: &AuthContext) -> ToolCommand {
        let mut command = ToolCommand::new(&self.tool)
            .arg(media.manifest.url.as_str())
            .arg("--save-dir")
            .arg(absolute(&self.output_dir).display().to_string())
            .arg("--save-name")
            .arg(media.output_name())
            .args(["--auto-select", "-M", "format=mp4", "--no-log", "-mt"]);

        if let Some(cookie) = auth.cookie() {
            command = command.arg("-H").arg(format!("Cookie: {}", cookie));
        }
        if let Some(referer) = &media.manifest.referer {
            command = command.arg("-H").arg(format!("Referer: {}", referer));
        }
        command = command.arg("-H").arg(format!("User-Agent: {}", auth.user_agent));
        if let Some(proxy) = &auth.proxy {
            command = command.arg("--custom-proxy").arg(proxy.as_str());
        }
        command.args(self.extra_args.iter().cloned())
    }

    /// Fetch and mux the stream into `<output_dir>/<name>.<ext>`
    pub async fn download(
        &self,
        media: &ResolvedMedia,
        auth: &AuthContext,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            HarvestError::file_system(&self.output_dir, crate::downloader::core::FileOperation::CreateDir, e)
        })?;

        info!("Running stream downloader for {}", media.identifier);
        let output = self.command(media, auth).run(cancel).await?;
        if !output.success() {
            error!("Stream downloader failed for {}: {}", media.identifier, output.diagnostics());
            return Err(HarvestError::ExternalTool {
                tool: self.tool.clone(),
                reason: format!("{}: {}", output.status, output.diagnostics()),
            });
        }

        existing_output(&self.output_dir, &media.output_name()).ok_or_else(|| HarvestError::ExternalTool {
            tool: self.tool.clone(),
            reason: format!("no output file for {}", media.output_name()),
        })
    }
}

/// First of `<dir>/<name>.{mp4,mkv,ts}` that exists
pub fn existing_output(dir: &Path, name: &str) -> Option<PathBuf> {
    OUTPUT_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", name, ext)))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Platform;
    use crate::resolver::{ManifestReference, MediaMetadata};

    fn media() -> ResolvedMedia {
        ResolvedMedia {
            identifier: "5950".into(),
            manifest: ManifestReference {
                url: "https://nanairo.co/videos/5950/cmaf/sdr/tok/index.m3u8".into(),
                token: Some("tok".into()),
                referer: Some("https://nanairo.co/ja/videos/5950".into()),
            },
            metadata: MediaMetadata { title: Some("Summer".into()), ..MediaMetadata::default() },
        }
    }

    #[test]
    fn test_command_line_matches_tool_conventions() {
        let config = HarvesterConfig {
            platform: Platform::Nanairo,
            cookie: Some("session=abc".into()),
            proxy: Some("http://127.0.0.1:7890".into()),
            external_tool_args: vec!["--thread-count".into(), "8".into()],
            ..HarvesterConfig::default()
        };
        let auth = AuthContext::from_config(&config);
        let tool = StreamTool::new("/opt/N_m3u8DL-RE", &config);
        let command = tool.command(&media(), &auth);
        let args = command.arguments();

        assert_eq!(args[0], "https://nanairo.co/videos/5950/cmaf/sdr/tok/index.m3u8");
        let name_at = args.iter().position(|a| a == "--save-name").unwrap();
        assert_eq!(args[name_at + 1], "5950_Summer");
        assert!(args.iter().any(|a| a == "Cookie: session=abc"));
        assert!(args.iter().any(|a| a == "Referer: https://nanairo.co/ja/videos/5950"));
        let proxy_at = args.iter().position(|a| a == "--custom-proxy").unwrap();
        assert_eq!(args[proxy_at + 1], "http://127.0.0.1:7890");
        assert_eq!(&args[args.len() - 2..], ["--thread-count", "8"]);
        assert!(!command.display().contains("session=abc"));
    }

    #[test]
    fn test_anonymous_context_sends_no_cookie() {
        let config = HarvesterConfig { platform: Platform::Nanairo, ..HarvesterConfig::default() };
        let auth = AuthContext::from_config(&config);
        let command = StreamTool::new("/opt/N_m3u8DL-RE", &config).command(&media(), &auth);

        assert!(!command.arguments().iter().any(|a| a.starts_with("Cookie:")));
        assert!(command.arguments().iter().any(|a| a.starts_with("User-Agent:")));
    }

    #[test]
    fn test_existing_output_checks_every_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(existing_output(dir.path(), "5950_Summer"), None);
        std::fs::write(dir.path().join("5950_Summer.ts"), b"x").unwrap();
        assert_eq!(existing_output(dir.path(), "5950_Summer"), Some(dir.path().join("5950_Summer.ts")));
    }
}
