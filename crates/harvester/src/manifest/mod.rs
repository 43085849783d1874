//! Manifest parsing and representation selection
//!
//! HLS playlists and DASH MPDs are both reduced to a flat list of
//! [`Representation`]s with absolute URLs; [`select`] then keeps the highest
//! bitrate per kind. Equal bitrates keep the entry that appears first in the
//! document.

pub mod dash;
pub mod hls;

use std::fmt;
use tracing::debug;
use url::Url;

use crate::downloader::core::{HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    /// Video with audio in the same stream
    Muxed,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Muxed => write!(f, "muxed"),
        }
    }
}

/// One selectable stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    /// Bits per second; 0 when the manifest does not say
    pub bitrate: u64,
    /// Absolute URL, passed through unmodified (signed query included)
    pub url: String,
    pub kind: MediaKind,
    /// HLS audio group: referenced by a variant, or owned by an audio rendition
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Hls,
    Dash,
}

impl ManifestFormat {
    /// Sniff the document, falling back to the URL's extension
    pub fn detect(bytes: &[u8], url: &str) -> Option<Self> {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
        let head = head.trim_start_matches('\u{feff}').trim_start();
        if head.starts_with("#EXTM3U") {
            return Some(ManifestFormat::Hls);
        }
        if head.starts_with('<') && head.contains("MPD") {
            return Some(ManifestFormat::Dash);
        }

        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".m3u8") {
            Some(ManifestFormat::Hls)
        } else if path.ends_with(".mpd") {
            Some(ManifestFormat::Dash)
        } else {
            None
        }
    }
}

/// Best representation per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Best video or muxed stream
    pub video: Option<Representation>,
    /// Best separate audio stream, from the video's audio group when it names one
    pub audio: Option<Representation>,
}

impl Selection {
    pub fn get(&self, kind: MediaKind) -> Option<&Representation> {
        match kind {
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Muxed => self.video.as_ref().filter(|r| r.kind == MediaKind::Muxed),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }
}

/// Parse a manifest of either format into representations in document order
pub fn parse(bytes: &[u8], manifest_url: &str) -> Result<Vec<Representation>> {
    match ManifestFormat::detect(bytes, manifest_url) {
        Some(ManifestFormat::Hls) => hls::parse(bytes, manifest_url),
        Some(ManifestFormat::Dash) => dash::parse(bytes, manifest_url),
        None => Err(parse_error(manifest_url, "neither an HLS playlist nor an MPD document")),
    }
}

/// Highest bitrate among `candidates`; ties keep the earliest
pub fn best<'a, I>(candidates: I) -> Option<&'a Representation>
where
    I: IntoIterator<Item = &'a Representation>,
{
    candidates.into_iter().fold(None, |best, candidate| match best {
        Some(current) if current.bitrate >= candidate.bitrate => Some(current),
        _ => Some(candidate),
    })
}

/// Pick the best stream per kind and check that every `required` kind is present
pub fn select(bytes: &[u8], manifest_url: &str, required: &[MediaKind]) -> Result<Selection> {
    let representations = parse(bytes, manifest_url)?;
    select_from(&representations, manifest_url, required)
}

pub fn select_from(representations: &[Representation], manifest_url: &str, required: &[MediaKind]) -> Result<Selection> {
    let video = best(representations.iter().filter(|r| matches!(r.kind, MediaKind::Video | MediaKind::Muxed))).cloned();

    let audio_tracks: Vec<&Representation> = representations.iter().filter(|r| r.kind == MediaKind::Audio).collect();
    let group = video.as_ref().and_then(|v| v.group.as_deref());
    let in_group: Vec<&Representation> = audio_tracks
        .iter()
        .copied()
        .filter(|a| group.is_some() && a.group.as_deref() == group)
        .collect();
    let candidates = if in_group.is_empty() { audio_tracks } else { in_group };
    let audio = best(candidates).cloned();

    if let Some(video) = &video {
        let bitrates: Vec<u64> = representations.iter().filter(|r| r.kind == video.kind).map(|r| r.bitrate).collect();
        debug!("Available {} bitrates: {:?}, using: {}", video.kind, bitrates, video.bitrate);
    }

    let selection = Selection { video, audio };
    for kind in required {
        if selection.get(*kind).is_none() {
            return Err(parse_error(manifest_url, &format!("no {} representation found", kind)));
        }
    }
    Ok(selection)
}

/// Resolve `reference` against `base`, leaving absolute URLs untouched
pub(crate) fn resolve_url(base: &Url, reference: &str) -> Option<String> {
    let cleaned: String = reference.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    base.join(&cleaned).ok().map(String::from)
}

pub(crate) fn parse_error(url: &str, reason: &str) -> HarvestError {
    HarvestError::ManifestParse {
        url: crate::downloader::core::files::url_hint(url),
        reason: reason.to_string(),
    }
}

pub(crate) fn base_url(manifest_url: &str) -> Result<Url> {
    Url::parse(manifest_url).map_err(|e| parse_error(manifest_url, &format!("invalid manifest URL: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rep(bitrate: u64, url: &str, kind: MediaKind) -> Representation {
        Representation { bitrate, url: url.to_string(), kind, group: None }
    }

    #[test]
    fn test_best_picks_highest_bitrate() {
        let reps = vec![
            rep(1000, "a", MediaKind::Video),
            rep(6000, "b", MediaKind::Video),
            rep(3000, "c", MediaKind::Video),
        ];
        assert_eq!(best(&reps).map(|r| r.url.as_str()), Some("b"));
    }

    #[test]
    fn test_best_keeps_first_on_ties() {
        let reps = vec![
            rep(2000, "low", MediaKind::Video),
            rep(6000, "first", MediaKind::Video),
            rep(6000, "second", MediaKind::Video),
        ];
        assert_eq!(best(&reps).map(|r| r.url.as_str()), Some("first"));
    }

    #[test]
    fn test_missing_required_kind_is_a_parse_error() {
        let reps = vec![rep(4000, "https://cdn/v.mp4", MediaKind::Video)];
        let err = select_from(&reps, "https://cdn/m.mpd", &[MediaKind::Video, MediaKind::Audio]).unwrap_err();
        assert!(matches!(err, HarvestError::ManifestParse { .. }));

        let ok = select_from(&reps, "https://cdn/m.mpd", &[MediaKind::Video]).unwrap();
        assert_eq!(ok.video.unwrap().bitrate, 4000);
        assert!(ok.audio.is_none());
    }

    #[test]
    fn test_audio_follows_the_video_group() {
        let mut video = rep(5000, "v", MediaKind::Video);
        video.group = Some("aac-hi".into());
        let mut low = rep(0, "audio-lo", MediaKind::Audio);
        low.group = Some("aac-lo".into());
        let mut high = rep(0, "audio-hi", MediaKind::Audio);
        high.group = Some("aac-hi".into());

        let selection = select_from(&[video, low, high], "https://x/m.m3u8", &[]).unwrap();
        assert_eq!(selection.audio.unwrap().url, "audio-hi");
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ManifestFormat::detect(b"#EXTM3U\n", "https://x/a"), Some(ManifestFormat::Hls));
        assert_eq!(ManifestFormat::detect(b"<?xml version=\"1.0\"?><MPD>", "https://x/a"), Some(ManifestFormat::Dash));
        assert_eq!(ManifestFormat::detect(b"", "https://x/a.mpd?sig=1"), Some(ManifestFormat::Dash));
        assert_eq!(ManifestFormat::detect(b"hello", "https://x/a.txt"), None);
    }
}
