//! Download slots and the decisions made from their results

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tokenmedia_common::{Dimensions, MediaType, TokenMetadata};

use super::error::PipelineError;
use crate::media::dimensions::{html_dimensions, raster_dimensions, svg_dimensions};
use crate::storage::artifacts::{ArtifactKind, SlotOutcome, WrittenArtifact};

const GZIP_ENCODING: &str = "gzip";
const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Image,
    Video,
}

impl Slot {
    pub fn artifact(self) -> ArtifactKind {
        match self {
            Slot::Image => ArtifactKind::Image,
            Slot::Video => ArtifactKind::Video,
        }
    }
}

/// How a downloaded body is written to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePlan {
    pub kind: ArtifactKind,
    pub content_type: String,
    pub content_encoding: Option<&'static str>,
}

fn declared_or_default(media_type: MediaType, declared: Option<&str>, family: &str) -> String {
    declared
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .filter(|ct| ct.starts_with(family))
        .unwrap_or_else(|| media_type.default_content_type())
        .to_ascii_lowercase()
}

/// `None` when the slot does not cache this type.
///
/// The image slot keeps stills only. The video slot keeps video, raw stills
/// and gzipped 3D animation; HTML is referenced, never cached.
pub fn cache_plan(slot: Slot, media_type: MediaType, declared: Option<&str>) -> Option<CachePlan> {
    let kind = slot.artifact();
    let plan = |content_type: String, content_encoding: Option<&'static str>| CachePlan {
        kind,
        content_type,
        content_encoding,
    };

    if media_type.is_still() {
        return Some(plan(declared_or_default(media_type, declared, "image/"), None));
    }

    match (slot, media_type) {
        (Slot::Video, MediaType::Video) => {
            Some(plan(declared_or_default(media_type, declared, "video/"), None))
        }
        (Slot::Video, MediaType::Animation) => {
            Some(plan(OCTET_STREAM.to_string(), Some(GZIP_ENCODING)))
        }
        _ => None,
    }
}

pub fn gzip(body: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Result of one download slot
#[derive(Debug, Clone, Default)]
pub struct SlotResult {
    pub url: Option<String>,
    /// Confirmed type when downloaded, predicted type otherwise
    pub media_type: MediaType,
    pub body: Option<Bytes>,
    pub cached: Option<WrittenArtifact>,
    pub error: Option<PipelineError>,
}

impl SlotResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn downloaded(&self) -> bool {
        self.body.is_some() && self.media_type.is_valid()
    }

    pub fn outcome(&self) -> SlotOutcome {
        SlotOutcome::new(self.cached.is_some(), self.media_type)
    }
}

/// Resolved type and the slot holding the primary media
pub fn resolve_primary(
    image: &SlotResult,
    video: &SlotResult,
    metadata: &TokenMetadata,
) -> (MediaType, Slot) {
    match (image.downloaded(), video.downloaded()) {
        (true, true) if image.media_type.priority() > video.media_type.priority() => {
            (image.media_type, Slot::Image)
        }
        (_, true) => (video.media_type, Slot::Video),
        (true, false) => (image.media_type, Slot::Image),
        (false, false) => {
            let hinted = metadata
                .media_type_hint()
                .map(MediaType::from_hint)
                .filter(MediaType::is_valid)
                .unwrap_or(MediaType::Unknown);
            let slot = if video.url.is_some() { Slot::Video } else { Slot::Image };
            (hinted, slot)
        }
    }
}

/// Dimensions readable without an external tool
pub fn inline_dimensions(media_type: MediaType, body: &[u8]) -> Dimensions {
    match media_type {
        MediaType::Svg => svg_dimensions(body),
        MediaType::Html => html_dimensions(body),
        MediaType::Image | MediaType::Gif | MediaType::Base64Bmp => raster_dimensions(body),
        _ => Dimensions::default(),
    }
}

/// Terminal error for a download stage where nothing usable arrived
pub fn all_failed(image: &SlotResult, video: &SlotResult) -> Option<PipelineError> {
    if image.body.is_some() || video.body.is_some() {
        return None;
    }
    let errors: Vec<&PipelineError> = [&image.error, &video.error].into_iter().flatten().collect();
    if errors.is_empty() {
        return None;
    }
    errors
        .iter()
        .find(|e| e.is_retryable())
        .or_else(|| errors.first())
        .map(|e| (*e).clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn downloaded(media_type: MediaType) -> SlotResult {
        SlotResult {
            url: Some("https://x/m".into()),
            media_type,
            body: Some(Bytes::from_static(b"body")),
            ..SlotResult::default()
        }
    }

    #[test]
    fn test_cache_plans() {
        let png = cache_plan(Slot::Image, MediaType::Image, Some("image/png; charset=binary")).unwrap();
        assert_eq!(png.kind, ArtifactKind::Image);
        assert_eq!(png.content_type, "image/png");

        let svg = cache_plan(Slot::Image, MediaType::Svg, Some("text/xml")).unwrap();
        assert_eq!(svg.content_type, "image/svg+xml");

        assert!(cache_plan(Slot::Image, MediaType::Video, Some("video/mp4")).is_none());
        assert!(cache_plan(Slot::Video, MediaType::Html, Some("text/html")).is_none());

        let glb = cache_plan(Slot::Video, MediaType::Animation, None).unwrap();
        assert_eq!(glb.content_type, "application/octet-stream");
        assert_eq!(glb.content_encoding, Some("gzip"));

        let video = cache_plan(Slot::Video, MediaType::Video, None).unwrap();
        assert_eq!((video.kind, video.content_type.as_str()), (ArtifactKind::Video, "video/mp4"));

        let bmp = cache_plan(Slot::Image, MediaType::Base64Bmp, None).unwrap();
        assert_eq!(bmp.content_type, "image/bmp");
    }

    #[test]
    fn test_gzip_round_trip() {
        let compressed = gzip(b"glTF binary").unwrap();
        let mut out = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut out).unwrap();
        assert_eq!(out, "glTF binary");
    }

    #[test]
    fn test_resolve_primary() {
        let metadata = TokenMetadata::new();
        let (resolved, slot) = resolve_primary(
            &downloaded(MediaType::Image),
            &downloaded(MediaType::Video),
            &metadata,
        );
        assert_eq!((resolved, slot), (MediaType::Video, Slot::Video));

        let (resolved, slot) =
            resolve_primary(&downloaded(MediaType::Gif), &SlotResult::empty(), &metadata);
        assert_eq!((resolved, slot), (MediaType::Gif, Slot::Image));
    }

    #[test]
    fn test_resolve_primary_from_hint() {
        let metadata = TokenMetadata::from_json(r#"{"format":"video/mp4"}"#).unwrap();
        let failed = SlotResult {
            url: Some("https://x/v".into()),
            error: Some(PipelineError::Transient("503".into())),
            ..SlotResult::default()
        };
        let (resolved, slot) = resolve_primary(&SlotResult::empty(), &failed, &metadata);
        assert_eq!((resolved, slot), (MediaType::Video, Slot::Video));

        let (resolved, _) =
            resolve_primary(&SlotResult::empty(), &failed, &TokenMetadata::new());
        assert_eq!(resolved, MediaType::Unknown);
    }

    #[test]
    fn test_all_failed_prefers_retryable() {
        let bad = SlotResult {
            error: Some(PipelineError::BadToken("404".into())),
            ..SlotResult::default()
        };
        let transient = SlotResult {
            error: Some(PipelineError::Transient("503".into())),
            ..SlotResult::default()
        };
        assert!(matches!(all_failed(&bad, &transient), Some(PipelineError::Transient(_))));
        assert!(matches!(all_failed(&bad, &SlotResult::empty()), Some(PipelineError::BadToken(_))));
        assert!(all_failed(&downloaded(MediaType::Image), &transient).is_none());
    }
}
