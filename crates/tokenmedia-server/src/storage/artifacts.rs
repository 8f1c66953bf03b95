//! Artifact layout and cache coherency
//!
//! Each token owns a small set of objects named `<prefix>-<name>` where
//! `name` is `<chain>-<contract>-<token_id>`. All writes and deletes go
//! through [`ArtifactWriter`], which deduplicates uploads by checksum and
//! purges the public URL after every change.
//!
//! After a run, [`stale_artifacts`] decides which objects no longer describe
//! the resolved media and [`ArtifactWriter::enforce_coherency`] removes them.
//! The resulting set always satisfies:
//!
//! - an image-like resolved type leaves no `thumbnail-*` or `liverender-*`
//! - without a cached animation there is no `liverender-*`
//! - an image-like image slot that was not cached leaves no `image-*`
//! - `thumbnail-*` exists only for an animation-like resolved type

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokenmedia_common::{checksum::sha256_hex, MediaType, TokenIdentifier};
use tracing::{debug, info, instrument, warn};

use super::{ObjectStore, PutOptions, StorageError};

/// Parallel deletes during coherency enforcement
pub const COHERENCY_DELETE_CONCURRENCY: usize = 4;

const PURGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    Image,
    Video,
    Svg,
    Thumbnail,
    LiveRender,
    /// Profile image, only ever replaced by its own run
    ProfileImage,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Video => "video",
            ArtifactKind::Svg => "svg",
            ArtifactKind::Thumbnail => "thumbnail",
            ArtifactKind::LiveRender => "liverender",
            ArtifactKind::ProfileImage => "pfp",
        }
    }

    pub fn object_key(&self, name: &str) -> String {
        format!("{}-{}", self.prefix(), name)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Artifact name for a token
pub fn artifact_name(token: &TokenIdentifier) -> String {
    token.to_string()
}

/// Outcome of one download slot as seen by the coherency rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotOutcome {
    pub cached: bool,
    pub media_type: MediaType,
}

impl SlotOutcome {
    pub fn new(cached: bool, media_type: MediaType) -> Self {
        Self { cached, media_type }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoherencyInput {
    pub image: SlotOutcome,
    pub video: SlotOutcome,
    pub resolved: MediaType,
    /// Artifacts written during this run; never deleted
    pub written: BTreeSet<ArtifactKind>,
}

/// Artifacts that must not survive this run
pub fn stale_artifacts(input: &CoherencyInput) -> BTreeSet<ArtifactKind> {
    let image = input.image;
    let video = input.video;
    let mut stale = BTreeSet::new();

    if !image.cached && image.media_type.is_image_like() {
        stale.insert(ArtifactKind::Image);
    }
    if !image.cached && image.media_type.is_animation_like() {
        stale.insert(ArtifactKind::LiveRender);
    }
    if !video.cached && video.media_type.is_animation_like() {
        stale.insert(ArtifactKind::Video);
        stale.insert(ArtifactKind::LiveRender);
    }

    let any_animation = image.media_type.is_animation_like()
        || video.media_type.is_animation_like()
        || input.resolved.is_animation_like();
    if (image.cached || video.cached) && !any_animation {
        stale.insert(ArtifactKind::Thumbnail);
        stale.insert(ArtifactKind::LiveRender);
    }

    if input.resolved.is_image_like() {
        stale.insert(ArtifactKind::Thumbnail);
        stale.insert(ArtifactKind::LiveRender);
    }

    let animation_cached = (image.cached && image.media_type.is_animation_like())
        || (video.cached && video.media_type.is_animation_like());
    if !animation_cached {
        stale.insert(ArtifactKind::LiveRender);
    }

    if !input.resolved.is_animation_like() {
        stale.insert(ArtifactKind::Thumbnail);
    }

    stale.retain(|kind| !input.written.contains(kind));
    stale
}

/// Result of writing one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArtifact {
    pub kind: ArtifactKind,
    pub key: String,
    pub url: String,
    pub content_type: String,
    pub checksum: String,
    pub size: usize,
    /// False when the stored object already carried the same body
    pub uploaded: bool,
}

#[derive(Clone)]
pub struct ArtifactWriter {
    store: Arc<dyn ObjectStore>,
    http: Option<reqwest::Client>,
}

impl ArtifactWriter {
    pub fn new(store: Arc<dyn ObjectStore>, http: reqwest::Client) -> Self {
        Self {
            store,
            http: Some(http),
        }
    }

    /// Writer that never issues CDN purges
    pub fn without_purge(store: Arc<dyn ObjectStore>) -> Self {
        Self { store, http: None }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn url(&self, kind: ArtifactKind, name: &str) -> String {
        self.store.public_url(&kind.object_key(name))
    }

    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn write(
        &self,
        kind: ArtifactKind,
        name: &str,
        body: Bytes,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<WrittenArtifact, StorageError> {
        let key = kind.object_key(name);
        let checksum = sha256_hex(&body);
        let size = body.len();

        let unchanged = match self.store.head(&key).await? {
            Some(head) => {
                head.checksum.as_deref() == Some(checksum.as_str())
                    && head.content_type.as_deref() == Some(content_type)
                    && head.content_encoding.as_deref() == content_encoding
            }
            None => false,
        };

        let url = self.store.public_url(&key);

        if unchanged {
            debug!(key = %key, "Artifact unchanged, skipping upload");
        } else {
            let mut options = PutOptions::new(content_type).with_checksum(checksum.clone());
            if let Some(encoding) = content_encoding {
                options = options.with_encoding(encoding);
            }
            self.store.put(&key, body, options).await?;
            self.purge(&url).await;
            info!(key = %key, "Artifact cached");
        }

        Ok(WrittenArtifact {
            kind,
            key,
            url,
            content_type: content_type.to_string(),
            checksum,
            size,
            uploaded: !unchanged,
        })
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, kind: ArtifactKind, name: &str) -> Result<(), StorageError> {
        let key = kind.object_key(name);
        self.store.delete(&key).await?;
        self.purge(&self.store.public_url(&key)).await;
        Ok(())
    }

    /// Delete every stale artifact, waiting for all deletes before returning.
    #[instrument(skip(self, input), fields(resolved = %input.resolved))]
    pub async fn enforce_coherency(
        &self,
        name: &str,
        input: &CoherencyInput,
    ) -> Result<BTreeSet<ArtifactKind>, StorageError> {
        let stale = stale_artifacts(input);
        if stale.is_empty() {
            return Ok(stale);
        }

        debug!(artifacts = ?stale, "Removing stale artifacts");

        let results: Vec<Result<(), StorageError>> = stream::iter(stale.iter().copied())
            .map(|kind| self.remove(kind, name))
            .buffer_unordered(COHERENCY_DELETE_CONCURRENCY)
            .collect()
            .await;

        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }

        Ok(stale)
    }

    /// Ask the CDN to drop its copy; failures never fail the write.
    async fn purge(&self, url: &str) {
        let Some(http) = &self.http else {
            return;
        };

        let method = match Method::from_bytes(b"PURGE") {
            Ok(method) => method,
            Err(_) => return,
        };

        match http.request(method, url).timeout(PURGE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "Purged public URL");
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "CDN purge rejected");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "CDN purge failed");
            }
        }
    }
}
