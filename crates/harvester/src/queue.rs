//! Durable per-identifier outcomes
//!
//! Two plain-text files, one identifier per line:
//! - the failure file, appended to when an identifier fails
//! - the pending list (when it is the run's source), rewritten without an
//!   identifier once it succeeds
//!
//! All writes go through one async mutex, so concurrent workers never
//! interleave or duplicate entries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::downloader::core::files::{append_extension, atomic_rename, ensure_parent_dir};
use crate::downloader::core::{FileOperation, HarvestError, Result};

#[derive(Debug)]
pub struct WorkQueue {
    failure_file: PathBuf,
    pending_file: Option<PathBuf>,
    /// Identifiers already present in the failure file, lowercased
    failed: Mutex<HashSet<String>>,
}

impl WorkQueue {
    /// Open the queue, loading identifiers the failure file already holds
    pub async fn open(failure_file: PathBuf, pending_file: Option<PathBuf>) -> Result<Self> {
        let failed = match fs::read_to_string(&failure_file).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_lowercase)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(HarvestError::file_system(&failure_file, FileOperation::Read, e)),
        };
        Ok(Self {
            failure_file,
            pending_file,
            failed: Mutex::new(failed),
        })
    }

    pub fn failure_file(&self) -> &Path {
        &self.failure_file
    }

    pub fn pending_file(&self) -> Option<&Path> {
        self.pending_file.as_deref()
    }

    /// Truncate the failure file so it only lists this run's failures
    pub async fn reset_failures(&self) -> Result<()> {
        let mut failed = self.failed.lock().await;
        ensure_parent_dir(&self.failure_file).await?;
        fs::write(&self.failure_file, b"")
            .await
            .map_err(|e| HarvestError::file_system(&self.failure_file, FileOperation::Write, e))?;
        failed.clear();
        Ok(())
    }

    /// Append `identifier` to the failure file unless it is already listed
    pub async fn record_failure(&self, identifier: &str) -> Result<()> {
        let mut failed = self.failed.lock().await;
        if !failed.insert(identifier.to_lowercase()) {
            debug!("{} already listed in {}", identifier, self.failure_file.display());
            return Ok(());
        }

        ensure_parent_dir(&self.failure_file).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_file)
            .await
            .map_err(|e| HarvestError::file_system(&self.failure_file, FileOperation::Write, e))?;
        file.write_all(format!("{}\n", identifier).as_bytes())
            .await
            .map_err(|e| HarvestError::file_system(&self.failure_file, FileOperation::Write, e))?;
        file.flush()
            .await
            .map_err(|e| HarvestError::file_system(&self.failure_file, FileOperation::Write, e))
    }

    /// Drop `identifier` (case-insensitively) from the pending list, if there is one
    pub async fn record_success(&self, identifier: &str) -> Result<()> {
        let Some(pending) = &self.pending_file else {
            return Ok(());
        };
        let _guard = self.failed.lock().await;

        let text = match fs::read_to_string(pending).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(HarvestError::file_system(pending, FileOperation::Read, e)),
        };

        let mut removed = false;
        let remaining: String = text
            .split_inclusive('\n')
            .filter(|line| {
                let matches = line.trim().eq_ignore_ascii_case(identifier);
                removed |= matches;
                !matches
            })
            .collect();
        if !removed {
            return Ok(());
        }

        let temp = append_extension(pending, "tmp");
        fs::write(&temp, remaining)
            .await
            .map_err(|e| HarvestError::file_system(&temp, FileOperation::Write, e))?;
        atomic_rename(&temp, pending).await?;
        info!("Removed {} from {}", identifier, pending.display());
        Ok(())
    }
}
