//! Decrypt-and-mux step for protected downloads
//!
//! The tool is run as `<tool> decrypt -i <video> -o <temp>/<ID>.mkv -t mgs -s <shop>`
//! from its own directory, with the account credentials in `MGS_USERNAME` /
//! `MGS_PASSWORD`. It picks up the audio track next to the video by name. The
//! result is written into the temp directory first and moved into the
//! decrypted directory only once the tool reports success.

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ToolCommand, absolute, tool_dir};
use crate::config::{HarvesterConfig, PASSWORD_ENV, USERNAME_ENV};
use crate::downloader::core::files::{ensure_parent_dir, move_file, remove_if_exists};
use crate::downloader::core::{HarvestError, Result};

#[derive(Debug, Clone)]
pub struct Decryptor {
    tool: PathBuf,
    temp_dir: PathBuf,
    decrypted_dir: PathBuf,
    shop_id: String,
    username: Option<String>,
    password: Option<String>,
}

impl Decryptor {
    pub fn new<P: Into<PathBuf>>(tool: P, config: &HarvesterConfig) -> Self {
        Self {
            tool: tool.into(),
            temp_dir: config.temp_dir.clone(),
            decrypted_dir: config.decrypted_dir.clone(),
            shop_id: config.shop_id.clone(),
            username: config.decrypt_username.clone().filter(|u| !u.is_empty()),
            password: config.decrypt_password.clone().filter(|p| !p.is_empty()),
        }
    }

    /// Final location of the decrypted container for `identifier`
    pub fn output_path(&self, identifier: &str) -> PathBuf {
        self.decrypted_dir.join(format!("{}.mkv", identifier.to_uppercase()))
    }

    fn temp_output_path(&self, identifier: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.mkv", identifier.to_uppercase()))
    }

    /// Build the invocation; credentials only ever appear in the environment
    pub fn command(&self, video: &Path, temp_output: &Path) -> ToolCommand {
        let mut command = ToolCommand::new(&self.tool)
            .arg("decrypt")
            .arg("-i")
            .arg(absolute(video).display().to_string())
            .arg("-o")
            .arg(absolute(temp_output).display().to_string())
            .args(["-t", "mgs", "-s"])
            .arg(self.shop_id.as_str());
        if let Some(username) = &self.username {
            command = command.env(USERNAME_ENV, username.as_str());
        }
        if let Some(password) = &self.password {
            command = command.env(PASSWORD_ENV, password.as_str());
        }
        if let Some(dir) = tool_dir(&self.tool) {
            command = command.working_dir(dir);
        }
        command
    }

    /// Decrypt `video` (and its sibling `audio`) into `<decrypted_dir>/<ID>.mkv`
    ///
    /// Raw inputs are left in place whatever the outcome.
    pub async fn decrypt(
        &self,
        identifier: &str,
        video: &Path,
        audio: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let failure = |reason: String| HarvestError::Decryption {
            identifier: identifier.to_string(),
            reason,
        };

        for input in std::iter::once(video).chain(audio) {
            if !input.exists() {
                return Err(failure(format!("input {} is missing", input.display())));
            }
        }

        let temp_output = self.temp_output_path(identifier);
        let final_output = self.output_path(identifier);
        ensure_parent_dir(&temp_output).await?;
        ensure_parent_dir(&final_output).await?;
        remove_if_exists(&temp_output).await?;

        info!("Decrypting {}", identifier);
        let output = match self.command(video, &temp_output).run(cancel).await {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => {
                remove_if_exists(&temp_output).await?;
                return Err(e);
            }
            Err(e) => return Err(failure(e.to_string())),
        };

        if !output.success() || !temp_output.exists() {
            error!("Decryptor failed for {} ({})", identifier, output.status);
            if !output.stdout.trim().is_empty() {
                error!("stdout: {}", output.stdout.trim());
            }
            if !output.stderr.trim().is_empty() {
                error!("stderr: {}", output.stderr.trim());
            }
            if let Err(e) = remove_if_exists(&temp_output).await {
                warn!("Could not remove partial output {}: {}", temp_output.display(), e);
            }
            let reason = if output.success() {
                "tool exited successfully but produced no output".to_string()
            } else {
                format!("{}: {}", output.status, output.diagnostics())
            };
            return Err(failure(reason));
        }

        move_file(&temp_output, &final_output).await?;
        info!("Decrypted {} -> {}", identifier, final_output.display());
        Ok(final_output)
    }
}
