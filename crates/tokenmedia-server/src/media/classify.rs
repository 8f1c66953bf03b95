//! Media type prediction and confirmation
//!
//! Prediction runs before a download: the URL extension first, then the
//! declared `Content-Type` of a `HEAD`, then a sniff of the first bytes.
//! Confirmation runs on the downloaded body and prefers what the bytes say.

use std::sync::Arc;
use tokenmedia_common::MediaType;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::transport::{MediaSource, Transport};

/// Bytes inspected when sniffing
pub const SNIFF_LEN: usize = 512;

/// Media type implied by the final path extension of a URI
pub fn extension_hint(raw: &str) -> Option<MediaType> {
    let path = match Url::parse(raw.trim()) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    MediaType::from_extension(ext)
}

/// Identify a body from its leading bytes
pub fn sniff(bytes: &[u8]) -> MediaType {
    if bytes.is_empty() {
        return MediaType::Invalid;
    }

    let starts = |magic: &[u8]| bytes.starts_with(magic);

    if starts(b"\x89PNG\r\n\x1a\n") || starts(b"\xFF\xD8\xFF") || starts(b"BM") {
        return MediaType::Image;
    }
    if starts(b"RIFF") && bytes.len() >= 12 {
        return match &bytes[8..12] {
            b"WEBP" => MediaType::Image,
            b"WAVE" => MediaType::Audio,
            b"AVI " => MediaType::Video,
            _ => MediaType::Unknown,
        };
    }
    if starts(b"GIF87a") || starts(b"GIF89a") {
        return MediaType::Gif;
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"avif" | b"avis" | b"heic" | b"heix" | b"mif1" => MediaType::Image,
            b"M4A " => MediaType::Audio,
            _ => MediaType::Video,
        };
    }
    if starts(b"\x1A\x45\xDF\xA3") {
        return MediaType::Video;
    }
    if starts(b"glTF") {
        return MediaType::Animation;
    }
    if starts(b"OggS") || starts(b"fLaC") || starts(b"ID3") || starts(b"\xFF\xFB") {
        return MediaType::Audio;
    }
    if starts(b"%PDF") {
        return MediaType::Pdf;
    }

    sniff_text(bytes)
}

fn sniff_text(bytes: &[u8]) -> MediaType {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        // A multi-byte character may be cut at the sniff boundary.
        Err(e) if e.valid_up_to() > 0 && e.error_len().is_none() => {
            std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return MediaType::Unknown,
    };

    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    let lower = trimmed.to_ascii_lowercase();

    if lower.starts_with("<svg") || (lower.starts_with("<?xml") && lower.contains("<svg")) {
        return MediaType::Svg;
    }
    if lower.starts_with("<!doctype html")
        || lower.starts_with("<html")
        || lower.starts_with("<iframe")
        || lower.contains("<head")
        || lower.contains("<body")
    {
        return MediaType::Html;
    }
    if lower.starts_with("<!doctype svg") {
        return MediaType::Svg;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return MediaType::Json;
    }
    MediaType::Text
}

/// Type for a source that never touches the network
fn local_type(source: &MediaSource) -> Option<MediaType> {
    match source {
        MediaSource::InlineSvg(_) => Some(MediaType::Svg),
        MediaSource::InlineJson(_) => Some(MediaType::Json),
        MediaSource::Data {
            content_type,
            base64,
            body,
        } => {
            if *base64 && content_type.as_deref() == Some("image/bmp") {
                return Some(MediaType::Base64Bmp);
            }
            let declared = content_type
                .as_deref()
                .map(MediaType::from_mime)
                .unwrap_or_default();
            if declared.is_valid() {
                Some(declared)
            } else {
                Some(sniff(body))
            }
        }
        MediaSource::Http(_) | MediaSource::Ipfs(_) | MediaSource::Arweave(_) => None,
    }
}

/// Resolve the type of a downloaded body
pub fn confirm(predicted: MediaType, content_type: Option<&str>, body: &[u8]) -> MediaType {
    let prefix = &body[..body.len().min(SNIFF_LEN)];
    let sniffed = sniff(prefix);

    if sniffed == MediaType::Invalid {
        return MediaType::Invalid;
    }
    if predicted == MediaType::Base64Bmp && sniffed == MediaType::Image {
        return MediaType::Base64Bmp;
    }
    if sniffed.is_valid() && sniffed != MediaType::Text {
        return sniffed;
    }

    let declared = content_type.map(MediaType::from_mime).unwrap_or_default();
    if declared.is_valid() {
        return declared;
    }
    if predicted.is_valid() {
        return predicted;
    }
    sniffed
}

/// Whether the image and animation candidates should trade places.
///
/// An animated asset in the image slot moves to the animation slot when the
/// animation slot holds nothing animated; otherwise the higher priority type
/// takes the animation slot when both are valid.
pub fn should_swap(image: MediaType, animation: MediaType) -> bool {
    if image.is_animation_like() && !animation.is_animation_like() {
        return true;
    }
    image.is_valid() && animation.is_valid() && image.priority() > animation.priority()
}

#[derive(Clone)]
pub struct Classifier {
    transport: Arc<Transport>,
}

impl Classifier {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Predict the type of a URI without downloading the whole body
    pub async fn predict(&self, raw: &str, cancel: &CancellationToken) -> MediaType {
        let source = match MediaSource::parse(raw) {
            Ok(source) => source,
            Err(_) => return MediaType::Invalid,
        };

        if let Some(media) = local_type(&source) {
            return media;
        }

        if let Some(media) = extension_hint(raw) {
            return media;
        }

        if source.supports_head() {
            match self.transport.head(raw, cancel).await {
                Ok(headers) => {
                    let declared = headers
                        .content_type
                        .as_deref()
                        .map(MediaType::from_mime)
                        .unwrap_or_default();
                    if declared.is_valid() {
                        return declared;
                    }
                }
                Err(e) => debug!(error = %e, "HEAD failed during prediction"),
            }
        }

        match self.transport.open(raw, cancel).await {
            Ok(stream) => match stream.read_prefix(SNIFF_LEN).await {
                Ok(prefix) => sniff(&prefix),
                Err(_) => MediaType::Unknown,
            },
            Err(e) => {
                debug!(error = %e, "Sniff failed during prediction");
                MediaType::Unknown
            }
        }
    }
}
