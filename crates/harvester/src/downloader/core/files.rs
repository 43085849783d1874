//! File operation utilities
//!
//! Partial transfers live next to their destination as `<name>.part`; parallel
//! transfers also keep a `<name>.part.meta` JSON sidecar describing how far
//! each sub-range got.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::error::{FileOperation, HarvestError, Result};

/// Append `.ext` to the full file name (`a.mp4` -> `a.mp4.part`)
pub fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// Path used for partial downloads of `dest_path`
pub fn create_temp_path(dest_path: &Path) -> PathBuf {
    append_extension(dest_path, "part")
}

/// Path of the resume sidecar for `dest_path`
pub fn create_meta_path(dest_path: &Path) -> PathBuf {
    append_extension(dest_path, "part.meta")
}

/// Size of the file at `path`, or `None` when it does not exist
pub async fn existing_size(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HarvestError::file_system(path, FileOperation::Metadata, e)),
    }
}

pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await
                .map_err(|e| HarvestError::file_system(parent, FileOperation::CreateDir, e))?;
        }
    }
    Ok(())
}

/// Atomically rename a temporary file to its final destination
pub async fn atomic_rename(temp_path: &Path, dest_path: &Path) -> Result<()> {
    fs::rename(temp_path, dest_path).await
        .map_err(|e| HarvestError::file_system(temp_path, FileOperation::Move, e))?;
    debug!("Atomically renamed {} to {}", temp_path.display(), dest_path.display());
    Ok(())
}

/// Move a file, falling back to copy and delete across file systems
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await
        .map_err(|e| HarvestError::file_system(to, FileOperation::Write, e))?;
    fs::remove_file(from).await
        .map_err(|e| HarvestError::file_system(from, FileOperation::Delete, e))?;
    Ok(())
}

pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HarvestError::file_system(path, FileOperation::Delete, e)),
    }
}

/// Progress of one contiguous sub-range `[start, end]` (inclusive)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentState {
    pub start: u64,
    pub end: u64,
    pub downloaded: u64,
}

impl SegmentState {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.len()
    }

    /// Next byte offset to request
    pub fn cursor(&self) -> u64 {
        self.start + self.downloaded
    }
}

/// Resume sidecar for a parallel transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeMetadata {
    /// Source URL without its query string, so signed tokens are never persisted
    pub url_hint: String,
    pub total_size: u64,
    pub segments: Vec<SegmentState>,
}

impl ResumeMetadata {
    /// Split `[offset, total)` into at most `parts` contiguous segments
    pub fn split(url_hint: String, offset: u64, total: u64, parts: usize) -> Self {
        let mut segments = Vec::new();
        if offset < total {
            let remaining = total - offset;
            let parts = (parts.max(1) as u64).min(remaining);
            let chunk = remaining.div_ceil(parts);
            let mut start = offset;
            while start < total {
                let end = (start + chunk - 1).min(total - 1);
                segments.push(SegmentState { start, end, downloaded: 0 });
                start = end + 1;
            }
        }
        Self { url_hint, total_size: total, segments }
    }

    pub fn bytes_done(&self) -> u64 {
        let pending: u64 = self.segments.iter().map(|s| s.len() - s.downloaded.min(s.len())).sum();
        self.total_size - pending
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(SegmentState::is_complete)
    }

    /// Segments must tile a suffix of `[0, total)` without gaps or overlap
    fn is_consistent(&self) -> bool {
        let mut expected_start = match self.segments.first() {
            Some(first) => first.start,
            None => return true,
        };
        for segment in &self.segments {
            if segment.start != expected_start || segment.end < segment.start || segment.downloaded > segment.len() {
                return false;
            }
            expected_start = segment.end + 1;
        }
        expected_start == self.total_size
    }

    pub async fn load(path: &Path, total_size: u64) -> Option<Self> {
        let json = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<ResumeMetadata>(&json) {
            Ok(meta) if meta.total_size == total_size && meta.is_consistent() => Some(meta),
            Ok(meta) => {
                warn!("Discarding resume data at {}: size {} does not match {}", path.display(), meta.total_size, total_size);
                None
            }
            Err(e) => {
                warn!("Discarding unreadable resume data at {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarvestError::file_system(path, FileOperation::Write, std::io::Error::other(e)))?;
        let temp = append_extension(path, "tmp");
        fs::write(&temp, json).await
            .map_err(|e| HarvestError::file_system(&temp, FileOperation::Write, e))?;
        atomic_rename(&temp, path).await
    }
}

/// Strip query and fragment from a URL for logs and sidecars
pub fn url_hint(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or(url).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_temp_paths_keep_extension() {
        let dest = Path::new("/data/ABF-249_video.mp4");
        assert_eq!(create_temp_path(dest), PathBuf::from("/data/ABF-249_video.mp4.part"));
        assert_eq!(create_meta_path(dest), PathBuf::from("/data/ABF-249_video.mp4.part.meta"));
    }

    #[test]
    fn test_split_covers_remaining_range() {
        let meta = ResumeMetadata::split("u".into(), 10, 110, 4);
        assert_eq!(meta.segments.len(), 4);
        assert_eq!(meta.segments[0].start, 10);
        assert_eq!(meta.segments.last().unwrap().end, 109);
        let covered: u64 = meta.segments.iter().map(SegmentState::len).sum();
        assert_eq!(covered, 100);
        assert_eq!(meta.bytes_done(), 10);
        assert!(meta.is_consistent());
    }

    #[test]
    fn test_split_never_creates_empty_segments() {
        let meta = ResumeMetadata::split("u".into(), 0, 3, 8);
        assert_eq!(meta.segments.len(), 3);
        assert!(meta.segments.iter().all(|s| s.len() == 1));

        let done = ResumeMetadata::split("u".into(), 5, 5, 4);
        assert!(done.segments.is_empty());
        assert!(done.is_complete());
    }

    #[test]
    fn test_url_hint_drops_signature() {
        assert_eq!(url_hint("https://cdn.example.com/v_6000.mp4?Policy=abc&Signature=def"), "https://cdn.example.com/v_6000.mp4");
    }

    #[tokio::test]
    async fn test_metadata_round_trip_and_size_guard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.mp4.part.meta");
        let mut meta = ResumeMetadata::split("u".into(), 0, 1000, 2);
        meta.segments[0].downloaded = 300;
        meta.save(&path).await.unwrap();

        assert_eq!(ResumeMetadata::load(&path, 1000).await, Some(meta));
        assert_eq!(ResumeMetadata::load(&path, 999).await, None);
    }
}
