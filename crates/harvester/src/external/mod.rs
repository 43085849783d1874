//! External tool invocation
//!
//! [`ToolCommand`] runs a helper program as a child process that is always
//! reaped: it completes, or it is killed and waited on when the run is
//! cancelled or the future is dropped. Secrets go through the child's
//! environment only, and logged command lines have header values redacted.

pub mod decryptor;
pub mod stream_tool;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::downloader::core::{HarvestError, Result};

pub use decryptor::Decryptor;
pub use stream_tool::StreamTool;

/// Header names whose values never reach the logs
const SENSITIVE_HEADERS: &[&str] = &["cookie", "authorization"];

/// Captured result of a finished tool
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Last few lines of stderr, falling back to stdout, for error messages
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr.trim().is_empty() { &self.stdout } else { &self.stderr };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        lines[lines.len().saturating_sub(5)..].join(" | ")
    }
}

#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable in the child's environment only
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Command line for logs, with sensitive header values masked
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        let mut after_header_flag = false;
        for arg in &self.args {
            let shown = if after_header_flag { redact_header(arg) } else { arg.clone() };
            after_header_flag = arg == "-H" || arg == "--header";
            parts.push(shown);
        }
        parts.join(" ")
    }

    /// Run to completion, or kill and reap the child once `cancel` fires
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ToolOutput> {
        debug!("Running: {}", self.display());
        if !self.env.is_empty() {
            let names: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
            debug!("With environment variables: {}", names.join(", "));
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| HarvestError::ExternalTool {
            tool: self.program.clone(),
            reason: format!("failed to start: {}", e),
        })?;

        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // kill() also waits, so the child is reaped before returning
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill {}: {}", self.program.display(), e);
                }
                stdout.abort();
                stderr.abort();
                return Err(HarvestError::Cancelled {
                    reason: format!("{} interrupted", self.program.display()),
                });
            }
            status = child.wait() => status.map_err(|e| HarvestError::ExternalTool {
                tool: self.program.clone(),
                reason: format!("failed to wait: {}", e),
            })?,
        };

        Ok(ToolOutput {
            status,
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn redact_header(value: &str) -> String {
    match value.split_once(':') {
        Some((name, _)) if SENSITIVE_HEADERS.contains(&name.trim().to_ascii_lowercase().as_str()) => {
            format!("{}: <redacted>", name.trim())
        }
        _ => value.to_string(),
    }
}

/// Directory a tool should run from: its own, unless it is the current one
pub(crate) fn tool_dir(tool: &Path) -> Option<PathBuf> {
    tool.parent()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("."))
        .map(Path::to_path_buf)
}

/// Absolute form of `path`, since tools run from their own directory
pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_display_masks_cookie_header() {
        let command = ToolCommand::new("N_m3u8DL-RE")
            .arg("https://x/index.m3u8")
            .args(["-H", "Cookie: session=secret"])
            .args(["-H", "Referer: https://x/ja/videos/1"]);
        let shown = command.display();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("Cookie: <redacted>"));
        assert!(shown.contains("Referer: https://x/ja/videos/1"));
    }

    #[test]
    fn test_diagnostics_prefers_stderr_tail() {
        let output = ToolOutput {
            status: exit_status(1),
            stdout: "progress".into(),
            stderr: "a\nb\nc\nd\ne\nf\n".into(),
        };
        assert_eq!(output.diagnostics(), "b | c | d | e | f");
    }

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(windows)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(code as u32)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_reaches_child_only() {
        let output = ToolCommand::new("/bin/sh")
            .args(["-c", "printf %s \"$HARVESTER_TEST_SECRET\""])
            .env("HARVESTER_TEST_SECRET", "hunter2")
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hunter2");
        assert!(std::env::var("HARVESTER_TEST_SECRET").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ToolCommand::new("/bin/sh").args(["-c", "sleep 10"]).run(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_external_tool_error() {
        let err = ToolCommand::new("/definitely/not/here/tool")
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::ExternalTool { .. }));
    }
}
