//! Identifier sources
//!
//! Work items come from a numeric range, a list file with one identifier per
//! line, or an inline list from the configuration. Every source yields its
//! identifiers de-duplicated in first-seen order.

use std::collections::HashSet;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use crate::downloader::core::{FileOperation, HarvestError, Result};

/// Where the identifiers of a run come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierSource {
    /// Inclusive numeric range
    Range { start: u64, end: u64 },
    /// Pending-list file, one identifier per line
    ListFile(PathBuf),
    Inline(Vec<String>),
}

impl IdentifierSource {
    /// The pending-list file, when this source is one
    pub fn list_file(&self) -> Option<&PathBuf> {
        match self {
            IdentifierSource::ListFile(path) => Some(path),
            _ => None,
        }
    }

    /// Produce the ordered, de-duplicated identifiers
    pub async fn identifiers(&self) -> Result<Vec<String>> {
        match self {
            IdentifierSource::Range { start, end } => {
                if start > end {
                    return Err(HarvestError::InvalidRange { start: *start, end: *end });
                }
                Ok((*start..=*end).map(|id| id.to_string()).collect())
            }
            IdentifierSource::ListFile(path) => {
                let text = match fs::read_to_string(path).await {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(HarvestError::SourceNotFound { path: path.clone() });
                    }
                    Err(e) => return Err(HarvestError::file_system(path, FileOperation::Read, e)),
                };
                let ids = dedup(text.lines());
                debug!("Read {} identifiers from {}", ids.len(), path.display());
                Ok(ids)
            }
            IdentifierSource::Inline(ids) => Ok(dedup(ids.iter().map(String::as_str))),
        }
    }
}

/// Trim, drop blanks and keep the first occurrence of each identifier
///
/// Identifiers differing only in case name the same title and the same
/// output files, so they count as duplicates; the first spelling is kept.
fn dedup<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_ascii_uppercase()))
        .map(str::to_string)
        .collect()
}
