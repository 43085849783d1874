//! DASH MPD documents addressed by `BaseURL`
//!
//! Only on-demand profiles are understood: each `Representation` must resolve
//! to a single file through the `BaseURL` chain MPD > Period > AdaptationSet >
//! Representation. Representations built from segment templates are skipped.

use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use tracing::debug;
use url::Url;

use super::{MediaKind, Representation, base_url, parse_error, resolve_url};
use crate::downloader::core::Result;

/// Bitrate in kbps embedded in file names such as `ABF-249_6000.mp4`
static FILE_BITRATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_(\d+)\.mp4").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Mpd,
    Period,
    AdaptationSet,
    Representation,
}

#[derive(Debug, Default)]
struct Scope {
    base: Option<String>,
    mime: Option<String>,
    bandwidth: Option<u64>,
}

#[derive(Default)]
struct Walker {
    stack: Vec<(Level, Scope)>,
    capturing_base: Option<String>,
    representations: Vec<Representation>,
    skipped: usize,
}

impl Walker {
    fn open(&mut self, level: Level, element: &BytesStart<'_>) {
        let mut scope = Scope::default();
        for attr in element.attributes().filter_map(|a| a.ok()) {
            let Ok(value) = attr.unescape_value() else {
                continue;
            };
            match attr.key.local_name().as_ref() {
                b"mimeType" => scope.mime = Some(value.to_string()),
                b"contentType" if scope.mime.is_none() => scope.mime = Some(value.to_string()),
                b"bandwidth" => scope.bandwidth = value.trim().parse().ok(),
                _ => {}
            }
        }
        self.stack.push((level, scope));
    }

    fn close(&mut self, level: Level, manifest: &Url) {
        let Some((closed, scope)) = self.stack.pop() else {
            return;
        };
        if closed != level {
            // Unbalanced document; restore and let the parser report it
            self.stack.push((closed, scope));
            return;
        }
        if level == Level::Representation {
            self.finish_representation(scope, manifest);
        }
    }

    fn finish_representation(&mut self, rep: Scope, manifest: &Url) {
        let set_has_base = self
            .stack
            .iter()
            .any(|(level, scope)| *level == Level::AdaptationSet && scope.base.is_some());
        if rep.base.is_none() && !set_has_base {
            self.skipped += 1;
            return;
        }

        let mut base = manifest.clone();
        for (_, scope) in &self.stack {
            if let Some(reference) = &scope.base {
                match resolve_url(&base, reference).and_then(|u| Url::parse(&u).ok()) {
                    Some(next) => base = next,
                    None => {
                        self.skipped += 1;
                        return;
                    }
                }
            }
        }
        let url = match &rep.base {
            Some(reference) => match resolve_url(&base, reference) {
                Some(url) => url,
                None => {
                    self.skipped += 1;
                    return;
                }
            },
            None => base.to_string(),
        };

        let mime = rep.mime.as_deref().or_else(|| {
            self.stack
                .iter()
                .rev()
                .find(|(level, _)| *level == Level::AdaptationSet)
                .and_then(|(_, scope)| scope.mime.as_deref())
        });
        let kind = classify(mime, &url);
        let bitrate = rep.bandwidth.or_else(|| file_bitrate(&url)).unwrap_or(0);

        self.representations.push(Representation { bitrate, url, kind, group: None });
    }

    fn set_base(&mut self, text: String) {
        if let Some((_, scope)) = self.stack.last_mut() {
            scope.base.get_or_insert(text);
        }
    }
}

fn level_of(name: &[u8]) -> Option<Level> {
    match name {
        b"MPD" => Some(Level::Mpd),
        b"Period" => Some(Level::Period),
        b"AdaptationSet" => Some(Level::AdaptationSet),
        b"Representation" => Some(Level::Representation),
        _ => None,
    }
}

fn classify(mime: Option<&str>, url: &str) -> MediaKind {
    match mime.map(|m| m.to_ascii_lowercase()) {
        Some(m) if m.starts_with("audio") => MediaKind::Audio,
        Some(m) if m.starts_with("video") => MediaKind::Video,
        _ if url.to_ascii_lowercase().contains("_audio.") => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

fn file_bitrate(url: &str) -> Option<u64> {
    let path = url.split('?').next().unwrap_or(url);
    FILE_BITRATE
        .captures(path)
        .and_then(|c| c[1].parse::<u64>().ok())
        .and_then(|kbps| kbps.checked_mul(1000))
}

/// Parse an MPD into representations in document order
pub fn parse(bytes: &[u8], manifest_url: &str) -> Result<Vec<Representation>> {
    let manifest = base_url(manifest_url)?;
    let text = String::from_utf8_lossy(bytes);
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    let mut walker = Walker::default();
    let mut saw_mpd = false;

    loop {
        match reader.read_event() {
            Err(e) => {
                return Err(parse_error(
                    manifest_url,
                    &format!("malformed MPD at byte {}: {}", reader.buffer_position(), e),
                ));
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"BaseURL" {
                    walker.capturing_base = Some(String::new());
                } else if let Some(level) = level_of(name.as_ref()) {
                    saw_mpd |= level == Level::Mpd;
                    walker.open(level, &e);
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(level) = level_of(e.local_name().as_ref()) {
                    walker.open(level, &e);
                    walker.close(level, &manifest);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"BaseURL" {
                    if let Some(text) = walker.capturing_base.take() {
                        walker.set_base(text);
                    }
                } else if let Some(level) = level_of(name.as_ref()) {
                    walker.close(level, &manifest);
                }
            }
            Ok(Event::Text(e)) => {
                if let (Some(buffer), Ok(text)) = (walker.capturing_base.as_mut(), e.unescape()) {
                    buffer.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(buffer) = walker.capturing_base.as_mut() {
                    buffer.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(_) => {}
        }
    }

    if !saw_mpd {
        return Err(parse_error(manifest_url, "document has no MPD root"));
    }
    if walker.skipped > 0 {
        debug!("Skipped {} representations without a BaseURL", walker.skipped);
    }
    Ok(walker.representations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::core::HarvestError;
    use crate::manifest::select;

    const MGSTAGE_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" profiles="urn:mpeg:dash:profile:isoff-on-demand:2011">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <Representation id="v1">
        <BaseURL><![CDATA[https://cdn.example.com/ABF-249/ABF-249_2000.mp4?t=abc&e=1]]></BaseURL>
      </Representation>
      <Representation id="v2">
        <BaseURL><![CDATA[https://cdn.example.com/ABF-249/ABF-249_6000.mp4?t=abc&e=1]]></BaseURL>
      </Representation>
      <Representation id="v3">
        <BaseURL>https://cdn.example.com/ABF-249/ABF-249_4000.mp4</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet>
      <Representation id="a1">
        <BaseURL><![CDATA[https://cdn.example.com/ABF-249/ABF-249_audio.mp4?t=abc&e=1]]></BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_mgstage_style_mpd_selects_best_video_and_audio() {
        let selection = select(
            MGSTAGE_MPD.as_bytes(),
            "https://api.example.com/manifest/ABF-249.mpd",
            &[MediaKind::Video, MediaKind::Audio],
        )
        .unwrap();

        let video = selection.video.unwrap();
        assert_eq!(video.bitrate, 6_000_000);
        assert_eq!(video.url, "https://cdn.example.com/ABF-249/ABF-249_6000.mp4?t=abc&e=1");
        let audio = selection.audio.unwrap();
        assert_eq!(audio.kind, MediaKind::Audio);
        assert_eq!(audio.url, "https://cdn.example.com/ABF-249/ABF-249_audio.mp4?t=abc&e=1");
    }

    #[test]
    fn test_base_urls_inherit_down_the_tree() {
        let mpd = r#"<MPD>
  <BaseURL>https://cdn.example.com/media/</BaseURL>
  <Period>
    <AdaptationSet contentType="audio">
      <BaseURL>audio/</BaseURL>
      <Representation id="a" bandwidth="128000"><BaseURL>track.m4a</BaseURL></Representation>
    </AdaptationSet>
    <AdaptationSet contentType="video">
      <Representation id="v" bandwidth="3500000"><BaseURL>video/main.mp4</BaseURL></Representation>
      <Representation id="t" bandwidth="9000000">
        <SegmentTemplate media="seg-$Number$.m4s" />
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let reps = parse(mpd.as_bytes(), "https://site.example.com/a/manifest.mpd").unwrap();
        assert_eq!(reps.len(), 2);
        assert_eq!(reps[0].url, "https://cdn.example.com/media/audio/track.m4a");
        assert_eq!(reps[0].kind, MediaKind::Audio);
        assert_eq!(reps[1].url, "https://cdn.example.com/media/video/main.mp4");
        assert_eq!(reps[1].bitrate, 3_500_000);
    }

    #[test]
    fn test_mpd_without_audio_fails_when_audio_required() {
        let mpd = r#"<MPD><Period><AdaptationSet mimeType="video/mp4">
<Representation bandwidth="1000"><BaseURL>https://cdn/v_1000.mp4</BaseURL></Representation>
</AdaptationSet></Period></MPD>"#;
        let err = select(mpd.as_bytes(), "https://x/m.mpd", &[MediaKind::Video, MediaKind::Audio]).unwrap_err();
        assert!(matches!(err, HarvestError::ManifestParse { .. }));
    }

    #[test]
    fn test_file_name_bitrate_fallback() {
        assert_eq!(file_bitrate("https://cdn.example.com/ABF-249_6000.mp4?Policy=p_1.mp4"), Some(6_000_000));
        assert_eq!(file_bitrate("https://cdn.example.com/ABF-249_18446744073709551.mp4"), None);
        assert_eq!(file_bitrate("https://cdn.example.com/ABF-249_audio.mp4"), None);
    }

    #[test]
    fn test_non_mpd_xml_is_rejected() {
        let err = parse(b"<html><body>Forbidden</body></html>", "https://x/m.mpd").unwrap_err();
        assert!(matches!(err, HarvestError::ManifestParse { .. }));
    }
}
