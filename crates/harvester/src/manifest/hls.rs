//! HLS playlists
//!
//! A master playlist yields one representation per `EXT-X-STREAM-INF`
//! variant plus one per `EXT-X-MEDIA TYPE=AUDIO` rendition that carries a URI.
//! A media playlist on its own is a single muxed representation.

use m3u8_rs::{AlternativeMediaType, Playlist};
use std::collections::HashSet;
use tracing::debug;

use super::{MediaKind, Representation, base_url, parse_error, resolve_url};
use crate::downloader::core::Result;

pub fn parse(bytes: &[u8], manifest_url: &str) -> Result<Vec<Representation>> {
    let base = base_url(manifest_url)?;
    let playlist = m3u8_rs::parse_playlist_res(bytes)
        .map_err(|_| parse_error(manifest_url, "invalid HLS playlist"))?;

    let master = match playlist {
        Playlist::MasterPlaylist(master) => master,
        Playlist::MediaPlaylist(_) => {
            debug!("Manifest is a media playlist, treating it as one muxed stream");
            return Ok(vec![Representation {
                bitrate: 0,
                url: manifest_url.to_string(),
                kind: MediaKind::Muxed,
                group: None,
            }]);
        }
    };

    let audio_renditions: Vec<_> = master
        .alternatives
        .iter()
        .filter(|media| matches!(media.media_type, AlternativeMediaType::Audio))
        .filter_map(|media| Some((media.group_id.clone(), media.uri.as_deref()?)))
        .collect();
    // Groups whose renditions have no URI are carried inside the variant itself
    let separate_groups: HashSet<&str> = audio_renditions.iter().map(|(group, _)| group.as_str()).collect();

    let mut representations = Vec::new();
    for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
        let Some(url) = resolve_url(&base, &variant.uri) else {
            continue;
        };
        let separate_audio = variant.audio.as_deref().is_some_and(|g| separate_groups.contains(g));
        representations.push(Representation {
            bitrate: variant.bandwidth,
            url,
            kind: if separate_audio { MediaKind::Video } else { MediaKind::Muxed },
            group: variant.audio.clone(),
        });
    }

    for (group, uri) in audio_renditions {
        if let Some(url) = resolve_url(&base, uri) {
            representations.push(Representation {
                bitrate: 0,
                url,
                kind: MediaKind::Audio,
                group: Some(group),
            });
        }
    }

    Ok(representations)
}

/// The one file behind a media playlist that addresses it by byte ranges
///
/// Returns `None` when segments live in separate files; those need the
/// external stream downloader.
pub fn single_resource(bytes: &[u8], playlist_url: &str) -> Result<Option<String>> {
    let base = base_url(playlist_url)?;
    let media = match m3u8_rs::parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(media)) => media,
        Ok(Playlist::MasterPlaylist(_)) => return Err(parse_error(playlist_url, "nested master playlist")),
        Err(_) => return Err(parse_error(playlist_url, "invalid HLS media playlist")),
    };

    let mut uris = media.segments.iter().flat_map(|segment| {
        std::iter::once(segment.uri.as_str()).chain(segment.map.as_ref().map(|map| map.uri.as_str()))
    });
    let Some(first) = uris.next() else {
        return Err(parse_error(playlist_url, "media playlist has no segments"));
    };

    if uris.all(|uri| uri == first) {
        Ok(resolve_url(&base, first))
    } else {
        Ok(None)
    }
}

/// Whether `url` points at another playlist rather than media
pub fn is_playlist_url(url: &str) -> bool {
    url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase().ends_with(".m3u8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::core::HarvestError;
    use crate::manifest::{select, select_from};

    const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:6
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"Japanese\",DEFAULT=YES,URI=\"audio/index.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=1000,RESOLUTION=640x360,AUDIO=\"aud\"
v1000/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=6000,RESOLUTION=1920x1080,AUDIO=\"aud\"
v6000/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000,RESOLUTION=1280x720,AUDIO=\"aud\"
v3000/index.m3u8
";

    #[test]
    fn test_master_playlist_picks_highest_variant_and_its_audio() {
        let url = "https://nanairo.co/videos/5950/cmaf/sdr/token/index.m3u8";
        let selection = select(MASTER.as_bytes(), url, &[MediaKind::Video]).unwrap();

        let video = selection.video.unwrap();
        assert_eq!(video.bitrate, 6000);
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.url, "https://nanairo.co/videos/5950/cmaf/sdr/token/v6000/index.m3u8");
        assert_eq!(
            selection.audio.unwrap().url,
            "https://nanairo.co/videos/5950/cmaf/sdr/token/audio/index.m3u8"
        );
    }

    #[test]
    fn test_equal_bandwidth_keeps_document_order() {
        let playlist = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=4000
first.mp4
#EXT-X-STREAM-INF:BANDWIDTH=4000
second.mp4
";
        let reps = parse(playlist.as_bytes(), "https://cdn.example.com/m.m3u8").unwrap();
        let selection = select_from(&reps, "https://cdn.example.com/m.m3u8", &[MediaKind::Video]).unwrap();
        let video = selection.video.unwrap();
        assert_eq!(video.url, "https://cdn.example.com/first.mp4");
        assert_eq!(video.kind, MediaKind::Muxed);
    }

    #[test]
    fn test_signed_query_is_passed_through() {
        let playlist = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=4000
https://cdn.example.com/v.mp4?Policy=abc&Signature=def&Expires=1700000000
";
        let reps = parse(playlist.as_bytes(), "https://site.example.com/m.m3u8").unwrap();
        assert_eq!(reps[0].url, "https://cdn.example.com/v.mp4?Policy=abc&Signature=def&Expires=1700000000");
    }

    #[test]
    fn test_media_playlist_with_byte_ranges_resolves_to_one_file() {
        let playlist = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:6
#EXT-X-MAP:URI=\"video.mp4\",BYTERANGE=\"800@0\"
#EXTINF:6.0,
#EXT-X-BYTERANGE:1000@800
video.mp4
#EXTINF:6.0,
#EXT-X-BYTERANGE:1000@1800
video.mp4
#EXT-X-ENDLIST
";
        let resource = single_resource(playlist.as_bytes(), "https://cdn.example.com/v6000/index.m3u8").unwrap();
        assert_eq!(resource.as_deref(), Some("https://cdn.example.com/v6000/video.mp4"));
    }

    #[test]
    fn test_segmented_media_playlist_has_no_single_resource() {
        let playlist = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
seg0.ts
#EXTINF:6.0,
seg1.ts
#EXT-X-ENDLIST
";
        assert_eq!(single_resource(playlist.as_bytes(), "https://cdn.example.com/index.m3u8").unwrap(), None);
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        let err = parse(b"<html>login required</html>", "https://x/index.m3u8").unwrap_err();
        assert!(matches!(err, HarvestError::ManifestParse { .. }));
    }

    #[test]
    fn test_playlist_url_detection() {
        assert!(is_playlist_url("https://x/a/index.m3u8?token=1"));
        assert!(!is_playlist_url("https://x/a/video_4000.mp4"));
    }
}
