use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TokenMediaError;

/// Category of a piece of token media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Unknown,
    Invalid,
    Image,
    Gif,
    Video,
    Audio,
    Animation,
    Html,
    Svg,
    Pdf,
    Json,
    Text,
    Base64Bmp,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Unknown => "unknown",
            MediaType::Invalid => "invalid",
            MediaType::Image => "image",
            MediaType::Gif => "gif",
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Animation => "animation",
            MediaType::Html => "html",
            MediaType::Svg => "svg",
            MediaType::Pdf => "pdf",
            MediaType::Json => "json",
            MediaType::Text => "text",
            MediaType::Base64Bmp => "base64bmp",
        }
    }

    /// Video, 3D animation or interactive HTML
    pub fn is_animation_like(&self) -> bool {
        matches!(self, MediaType::Video | MediaType::Animation | MediaType::Html)
    }

    pub fn is_image_like(&self) -> bool {
        matches!(self, MediaType::Image | MediaType::Gif | MediaType::Svg)
    }

    /// Image-like, or an inline BMP; either is cached as `image-*`
    pub fn is_still(&self) -> bool {
        self.is_image_like() || *self == MediaType::Base64Bmp
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, MediaType::Unknown | MediaType::Invalid)
    }

    /// Rank used when two candidates both classify validly; higher wins the primary slot.
    ///
    /// `Animation > HTML > Video > GIF > SVG > Image > Audio > Text > PDF > JSON > Unknown`
    pub fn priority(&self) -> u8 {
        match self {
            MediaType::Animation => 10,
            MediaType::Html => 9,
            MediaType::Video => 8,
            MediaType::Gif => 7,
            MediaType::Svg => 6,
            MediaType::Image | MediaType::Base64Bmp => 5,
            MediaType::Audio => 4,
            MediaType::Text => 3,
            MediaType::Pdf => 2,
            MediaType::Json => 1,
            MediaType::Unknown | MediaType::Invalid => 0,
        }
    }

    /// Map a `Content-Type` value; parameters such as `charset` are ignored.
    pub fn from_mime(content_type: &str) -> MediaType {
        let Ok(parsed) = content_type.trim().parse::<mime::Mime>() else {
            return MediaType::Unknown;
        };

        match (parsed.type_().as_str(), parsed.subtype().as_str()) {
            ("image", "gif") => MediaType::Gif,
            ("image", "svg") => MediaType::Svg,
            ("image", _) => MediaType::Image,
            ("video", _) => MediaType::Video,
            ("audio", _) => MediaType::Audio,
            ("model", _) => MediaType::Animation,
            ("text", "html") => MediaType::Html,
            ("text", _) => MediaType::Text,
            ("application", "pdf") => MediaType::Pdf,
            ("application", "json") => MediaType::Json,
            ("application", "octet-stream") => MediaType::Unknown,
            ("application", sub) if sub.starts_with("gltf") => MediaType::Animation,
            _ => MediaType::Unknown,
        }
    }

    /// Map a file extension (without the dot), case-insensitive
    pub fn from_extension(ext: &str) -> Option<MediaType> {
        let media = match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" => MediaType::Image,
            "gif" => MediaType::Gif,
            "mp4" | "webm" => MediaType::Video,
            "glb" | "gltf" => MediaType::Animation,
            "svg" => MediaType::Svg,
            "pdf" => MediaType::Pdf,
            "html" | "htm" => MediaType::Html,
            _ => return None,
        };
        Some(media)
    }

    /// Interpret a free-form metadata hint such as `media_type` or `format`.
    ///
    /// Accepts type names (`"video"`), MIME types (`"video/mp4"`) and bare
    /// extensions (`"mp4"`).
    pub fn from_hint(hint: &str) -> MediaType {
        let hint = hint.trim();
        if let Ok(media) = hint.parse::<MediaType>() {
            return media;
        }
        if hint.contains('/') {
            return MediaType::from_mime(hint);
        }
        MediaType::from_extension(hint).unwrap_or(MediaType::Unknown)
    }

    /// Content type used when the origin did not declare one
    pub fn default_content_type(&self) -> &'static str {
        match self {
            MediaType::Image => "image/png",
            MediaType::Gif => "image/gif",
            MediaType::Video => "video/mp4",
            MediaType::Audio => "audio/mpeg",
            MediaType::Animation => "model/gltf-binary",
            MediaType::Html => "text/html",
            MediaType::Svg => "image/svg+xml",
            MediaType::Pdf => "application/pdf",
            MediaType::Json => "application/json",
            MediaType::Text => "text/plain",
            MediaType::Base64Bmp => "image/bmp",
            MediaType::Unknown | MediaType::Invalid => "application/octet-stream",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = TokenMediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let media = match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => MediaType::Unknown,
            "invalid" => MediaType::Invalid,
            "image" => MediaType::Image,
            "gif" => MediaType::Gif,
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "animation" => MediaType::Animation,
            "html" => MediaType::Html,
            "svg" => MediaType::Svg,
            "pdf" => MediaType::Pdf,
            "json" => MediaType::Json,
            "text" => MediaType::Text,
            "base64bmp" => MediaType::Base64Bmp,
            _ => return Err(TokenMediaError::InvalidMediaType(s.to_string())),
        };
        Ok(media)
    }
}

/// Pixel size of a piece of media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}
