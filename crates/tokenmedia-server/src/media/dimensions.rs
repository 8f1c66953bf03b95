//! In-process dimension extraction for SVG, HTML and raster images

use scraper::{Html, Selector};
use serde::Deserialize;
use std::io::Cursor;
use tokenmedia_common::Dimensions;
use tracing::debug;

/// Root `<svg>` attributes we care about
#[derive(Debug, Deserialize)]
struct SvgRoot {
    #[serde(rename = "@width", default)]
    width: Option<String>,
    #[serde(rename = "@height", default)]
    height: Option<String>,
    #[serde(rename = "@viewBox", default)]
    view_box: Option<String>,
}

/// Width and height of the root element, or the size part of its `viewBox`
pub fn svg_dimensions(body: &[u8]) -> Dimensions {
    let text = String::from_utf8_lossy(body);
    let root: SvgRoot = match quick_xml::de::from_str(&text) {
        Ok(root) => root,
        Err(e) => {
            debug!(error = %e, "Failed to parse SVG root");
            return Dimensions::default();
        }
    };

    let explicit = match (
        root.width.as_deref().and_then(parse_length),
        root.height.as_deref().and_then(parse_length),
    ) {
        (Some(width), Some(height)) => Dimensions::new(width, height),
        _ => Dimensions::default(),
    };
    if explicit.is_valid() {
        return explicit;
    }

    root.view_box
        .as_deref()
        .map(view_box_dimensions)
        .unwrap_or_default()
}

fn view_box_dimensions(view_box: &str) -> Dimensions {
    let parts: Vec<&str> = view_box
        .split(|c: char| c.is_ascii_whitespace() || c == ',')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 4 {
        return Dimensions::default();
    }
    match (parse_length(parts[2]), parse_length(parts[3])) {
        (Some(width), Some(height)) => Dimensions::new(width, height),
        _ => Dimensions::default(),
    }
}

/// `"512"`, `"512.5px"` and similar; relative units are rejected
fn parse_length(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.ends_with('%') || raw.ends_with("em") {
        return None;
    }
    let numeric = raw.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let value: f64 = numeric.trim().parse().ok()?;
    if !value.is_finite() || value <= 0.0 || value > u32::MAX as f64 {
        return None;
    }
    Some(value.round() as u32)
}

/// Attributes of the first `<iframe>` in the document
pub fn html_dimensions(body: &[u8]) -> Dimensions {
    let text = String::from_utf8_lossy(body);
    let document = Html::parse_document(&text);
    let Ok(selector) = Selector::parse("iframe") else {
        return Dimensions::default();
    };

    document
        .select(&selector)
        .next()
        .and_then(|iframe| {
            let width = iframe.value().attr("width").and_then(parse_length)?;
            let height = iframe.value().attr("height").and_then(parse_length)?;
            Some(Dimensions::new(width, height))
        })
        .unwrap_or_default()
}

/// Size from the encoded header without decoding pixels
pub fn raster_dimensions(body: &[u8]) -> Dimensions {
    let reader = match image::ImageReader::new(Cursor::new(body)).with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => {
            debug!(error = %e, "Failed to guess raster format");
            return Dimensions::default();
        }
    };
    match reader.into_dimensions() {
        Ok((width, height)) => Dimensions::new(width, height),
        Err(e) => {
            debug!(error = %e, "Failed to read raster dimensions");
            Dimensions::default()
        }
    }
}
