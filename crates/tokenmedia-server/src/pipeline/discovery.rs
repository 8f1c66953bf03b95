//! Finding the image and animation URLs in raw metadata

use tokenmedia_common::{MediaType, TokenMetadata};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::options::JobOptions;
use crate::media::classify::{extension_hint, should_swap};
use crate::media::{Classifier, MediaSource};

/// Image and animation candidates, with their predicted types
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaCandidates {
    pub image: Option<String>,
    pub animation: Option<String>,
    pub image_type: MediaType,
    pub animation_type: MediaType,
}

impl MediaCandidates {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.animation.is_none()
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.image, &mut self.animation);
        std::mem::swap(&mut self.image_type, &mut self.animation_type);
    }
}

/// Usable as a media source
fn usable(value: &str) -> bool {
    MediaSource::parse(value).is_ok()
}

fn exact_keyword<'a>(metadata: &'a TokenMetadata, keywords: &[String]) -> Option<&'a str> {
    keywords
        .iter()
        .filter_map(|key| metadata.get_str(key))
        .find(|value| usable(value))
}

fn containing_keyword<'a>(
    metadata: &'a TokenMetadata,
    keywords: &[String],
    skip: Option<&str>,
) -> Option<&'a str> {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    metadata.iter().find_map(|(key, _)| {
        if Some(key.as_str()) == skip {
            return None;
        }
        let lowered = key.to_lowercase();
        if !keywords.iter().any(|k| lowered.contains(k.as_str())) {
            return None;
        }
        metadata.get_str(key).filter(|value| usable(value))
    })
}

/// Candidate URLs from metadata alone.
///
/// `media.{mimeType, uri}` wins, then exact keyword keys, then any top-level
/// key containing a keyword. The placeholder fills an empty image slot.
pub fn discover(metadata: &TokenMetadata, options: &JobOptions) -> MediaCandidates {
    let mut image: Option<&str> = None;
    let mut animation: Option<&str> = None;

    if let Some(uri) = metadata.media_uri().filter(|uri| usable(uri)) {
        let declared = metadata
            .media_mime_type()
            .map(MediaType::from_mime)
            .filter(MediaType::is_valid)
            .or_else(|| extension_hint(uri))
            .unwrap_or_default();
        if declared.is_animation_like() {
            animation = Some(uri);
        } else {
            image = Some(uri);
        }
    }

    let profile_key = options.profile_image_key.as_deref();

    if image.is_none() {
        image = exact_keyword(metadata, &options.image_keywords)
            .or_else(|| containing_keyword(metadata, &options.image_keywords, profile_key));
    }
    if animation.is_none() {
        animation = exact_keyword(metadata, &options.animation_keywords)
            .or_else(|| containing_keyword(metadata, &options.animation_keywords, profile_key));
    }

    if animation.is_some() && animation == image {
        animation = None;
    }

    let image = image
        .map(str::to_string)
        .or_else(|| options.placeholder_image_url.clone());

    MediaCandidates {
        image,
        animation: animation.map(str::to_string),
        ..MediaCandidates::default()
    }
}

/// Trade the slots when the swap rule says the image slot holds the animation
pub fn apply_swap(candidates: &mut MediaCandidates) -> bool {
    if should_swap(candidates.image_type, candidates.animation_type) {
        candidates.swap();
        return true;
    }
    false
}

/// Predict both candidates, then apply the swap rule
pub async fn resolve(
    classifier: &Classifier,
    mut candidates: MediaCandidates,
    cancel: &CancellationToken,
) -> MediaCandidates {
    let predict = |raw: Option<String>| async move {
        match raw {
            Some(raw) => classifier.predict(&raw, cancel).await,
            None => MediaType::Unknown,
        }
    };

    let (image_type, animation_type) = tokio::join!(
        predict(candidates.image.clone()),
        predict(candidates.animation.clone())
    );
    candidates.image_type = image_type;
    candidates.animation_type = animation_type;

    if apply_swap(&mut candidates) {
        debug!(
            image = ?candidates.image,
            animation = ?candidates.animation,
            "Swapped image and animation candidates"
        );
    }
    candidates
}
