//! Job definition and per-job options

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokenmedia_common::{TokenIdentifier, TokenMetadata};
use uuid::Uuid;

/// Default metadata keys that may hold the still image
pub const DEFAULT_IMAGE_KEYWORDS: &[&str] = &["image", "image_url", "imageUrl", "image_data"];

/// Default metadata keys that may hold the animation
pub const DEFAULT_ANIMATION_KEYWORDS: &[&str] = &[
    "animation_url",
    "animationUrl",
    "animation",
    "video",
    "video_url",
];

/// Decides whether metadata carries the platform signature a job requires
pub type SignedPredicate = Arc<dyn Fn(&TokenMetadata) -> bool + Send + Sync>;

/// Why a job was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCause {
    Refresh,
    Transfer,
    Sync,
    Mint,
}

impl JobCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCause::Refresh => "refresh",
            JobCause::Transfer => "transfer",
            JobCause::Sync => "sync",
            JobCause::Mint => "mint",
        }
    }
}

impl fmt::Display for JobCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct JobOptions {
    pub profile_image_key: Option<String>,
    pub refresh_metadata: bool,
    pub starting_metadata: Option<TokenMetadata>,
    pub is_spam_job: bool,
    pub require_image: bool,
    pub require_signed: Option<SignedPredicate>,
    pub image_keywords: Vec<String>,
    pub animation_keywords: Vec<String>,
    pub placeholder_image_url: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            profile_image_key: None,
            refresh_metadata: false,
            starting_metadata: None,
            is_spam_job: false,
            require_image: false,
            require_signed: None,
            image_keywords: DEFAULT_IMAGE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            animation_keywords: DEFAULT_ANIMATION_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            placeholder_image_url: None,
        }
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("profile_image_key", &self.profile_image_key)
            .field("refresh_metadata", &self.refresh_metadata)
            .field("starting_metadata", &self.starting_metadata.is_some())
            .field("is_spam_job", &self.is_spam_job)
            .field("require_image", &self.require_image)
            .field("require_signed", &self.require_signed.is_some())
            .field("image_keywords", &self.image_keywords)
            .field("animation_keywords", &self.animation_keywords)
            .field("placeholder_image_url", &self.placeholder_image_url)
            .finish()
    }
}

impl JobOptions {
    pub fn with_profile_image_key(mut self, key: impl Into<String>) -> Self {
        self.profile_image_key = Some(key.into());
        self
    }

    pub fn with_refresh_metadata(mut self) -> Self {
        self.refresh_metadata = true;
        self
    }

    pub fn with_starting_metadata(mut self, metadata: TokenMetadata) -> Self {
        self.starting_metadata = Some(metadata);
        self
    }

    pub fn as_spam(mut self) -> Self {
        self.is_spam_job = true;
        self
    }

    pub fn with_require_image(mut self) -> Self {
        self.require_image = true;
        self
    }

    pub fn with_require_signed(mut self, predicate: SignedPredicate) -> Self {
        self.require_signed = Some(predicate);
        self
    }

    pub fn with_keywords(
        mut self,
        image_keywords: impl IntoIterator<Item = impl Into<String>>,
        animation_keywords: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.image_keywords = image_keywords.into_iter().map(Into::into).collect();
        self.animation_keywords = animation_keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_placeholder_image_url(mut self, url: impl Into<String>) -> Self {
        self.placeholder_image_url = Some(url.into());
        self
    }

    /// Starting metadata that should be used instead of a provider fetch
    pub fn usable_starting_metadata(&self) -> Option<&TokenMetadata> {
        self.starting_metadata.as_ref().filter(|m| !m.is_empty())
    }
}

/// Predicate requiring a non-empty string at `key`
pub fn signed_by_field(key: impl Into<String>) -> SignedPredicate {
    let key = key.into();
    Arc::new(move |metadata: &TokenMetadata| metadata.get_str(&key).is_some())
}

/// One processing request for one token
#[derive(Debug, Clone)]
pub struct Job {
    pub run_id: Uuid,
    pub token: TokenIdentifier,
    pub cause: JobCause,
    pub options: JobOptions,
}

impl Job {
    pub fn new(token: TokenIdentifier, cause: JobCause, options: JobOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            token,
            cause,
            options,
        }
    }
}

/// Serializable job options carried in task bodies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptionsPayload {
    pub profile_image_key: Option<String>,
    pub refresh_metadata: bool,
    pub starting_metadata: Option<TokenMetadata>,
    pub is_spam_job: bool,
    pub require_image: bool,
    /// Metadata key whose presence marks a platform-signed token
    pub require_signed_field: Option<String>,
    pub image_keywords: Option<Vec<String>>,
    pub animation_keywords: Option<Vec<String>>,
    pub placeholder_image_url: Option<String>,
}

impl From<JobOptionsPayload> for JobOptions {
    fn from(payload: JobOptionsPayload) -> Self {
        let defaults = JobOptions::default();
        JobOptions {
            profile_image_key: payload.profile_image_key,
            refresh_metadata: payload.refresh_metadata,
            starting_metadata: payload.starting_metadata,
            is_spam_job: payload.is_spam_job,
            require_image: payload.require_image,
            require_signed: payload.require_signed_field.map(signed_by_field),
            image_keywords: payload.image_keywords.unwrap_or(defaults.image_keywords),
            animation_keywords: payload
                .animation_keywords
                .unwrap_or(defaults.animation_keywords),
            placeholder_image_url: payload.placeholder_image_url,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = JobOptions::default();
        assert!(!options.refresh_metadata);
        assert!(!options.require_image);
        assert!(options.image_keywords.contains(&"image".to_string()));
        assert!(options.animation_keywords.contains(&"animation_url".to_string()));
    }

    #[test]
    fn test_empty_starting_metadata_is_ignored() {
        let options = JobOptions::default().with_starting_metadata(TokenMetadata::new());
        assert!(options.usable_starting_metadata().is_none());
    }

    #[test]
    fn test_payload_conversion() {
        let payload: JobOptionsPayload = serde_json::from_str(
            r#"{"require_image":true,"require_signed_field":"signature","image_keywords":["thumb"]}"#,
        )
        .unwrap();
        let options = JobOptions::from(payload);
        assert!(options.require_image);
        assert_eq!(options.image_keywords, vec!["thumb".to_string()]);
        assert!(options.animation_keywords.contains(&"animation_url".to_string()));

        let predicate = options.require_signed.unwrap();
        assert!(!predicate(&TokenMetadata::new()));
        assert!(predicate(
            &TokenMetadata::from_json(r#"{"signature":"0xsig"}"#).unwrap()
        ));
    }
}
