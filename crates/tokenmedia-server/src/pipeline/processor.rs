//! Per-token run: metadata, discovery, download, classification, transcode,
//! coherency and persistence
//!
//! One [`TokenProcessor`] is shared by every worker. A run holds the token
//! lock from before metadata retrieval until after persistence; a second run
//! on the same token returns [`PipelineError::BusyDuplicate`] immediately.

use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokenmedia_common::{Dimensions, MediaType, TokenIdentifier, TokenMetadata};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::discovery::{self, MediaCandidates};
use super::download::{
    all_failed, cache_plan, gzip, inline_dimensions, resolve_primary, Slot, SlotResult,
};
use super::error::PipelineError;
use super::lock::{TokenLock, DEFAULT_LOCK_TTL};
use super::metadata::{PipelineMetadata, Step};
use super::options::Job;
use crate::db::{PipelineResults, TokenMedia, TokenMediaRow, TokenProperties, TokenRepository};
use crate::media::classify::confirm;
use crate::media::{Classifier, Transcoder, Transport};
use crate::providers::ProviderRegistry;
use crate::storage::artifacts::{
    artifact_name, ArtifactKind, ArtifactWriter, CoherencyInput, WrittenArtifact,
};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Persistence budget; not tied to the job's cancellation
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub job_timeout: Duration,
    pub download_timeout: Duration,
    pub transcode_timeout: Duration,
    pub persist_timeout: Duration,
    pub lock_ttl: Duration,
    pub processor_version: String,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            transcode_timeout: DEFAULT_TRANSCODE_TIMEOUT,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
            processor_version: concat!("tokenmedia-server/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// What a run produced
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub run_id: Uuid,
    pub media: Option<TokenMediaRow>,
    pub properties: TokenProperties,
    pub pipeline_metadata: PipelineMetadata,
    /// The persisted run ended in this error
    pub error: Option<PipelineError>,
}

/// A cancellation token that fires after `timeout` or when its parent fires
struct Deadline {
    token: CancellationToken,
    watchdog: JoinHandle<()>,
}

impl Deadline {
    fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let trigger = token.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trigger.cancel();
        });
        Self { token, watchdog }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

/// Mutable state of one run
struct Run {
    pipeline: PipelineMetadata,
    metadata: TokenMetadata,
    media: Option<TokenMedia>,
}

/// Output of the download and classification stages
struct Downloads {
    image: SlotResult,
    video: SlotResult,
    resolved: MediaType,
    primary: Slot,
}

impl Downloads {
    fn primary(&self) -> &SlotResult {
        match self.primary {
            Slot::Image => &self.image,
            Slot::Video => &self.video,
        }
    }
}

#[derive(Default)]
struct Derived {
    thumbnail: Option<WrittenArtifact>,
    live_render: Option<WrittenArtifact>,
    dimensions: Dimensions,
    written: BTreeSet<ArtifactKind>,
}

#[derive(Clone)]
pub struct TokenProcessor {
    providers: Arc<ProviderRegistry>,
    classifier: Classifier,
    transport: Arc<Transport>,
    transcoder: Arc<dyn Transcoder>,
    artifacts: ArtifactWriter,
    repository: Arc<dyn TokenRepository>,
    lock: Arc<dyn TokenLock>,
    settings: ProcessorSettings,
}

impl TokenProcessor {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        transport: Arc<Transport>,
        transcoder: Arc<dyn Transcoder>,
        artifacts: ArtifactWriter,
        repository: Arc<dyn TokenRepository>,
        lock: Arc<dyn TokenLock>,
    ) -> Self {
        Self {
            providers,
            classifier: Classifier::new(transport.clone()),
            transport,
            transcoder,
            artifacts,
            repository,
            lock,
            settings: ProcessorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProcessorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn repository(&self) -> &Arc<dyn TokenRepository> {
        &self.repository
    }

    /// Run one job to completion.
    ///
    /// `Ok` means a row was persisted, possibly carrying an error. `Err` is
    /// returned for lock contention, lock service failure and persistence
    /// failure; nothing is persisted in those cases.
    #[instrument(
        skip_all,
        fields(
            run_id = %job.run_id,
            token = %job.token,
            cause = %job.cause,
            spam = job.options.is_spam_job
        )
    )]
    pub async fn process(&self, job: Job) -> Result<JobOutcome, PipelineError> {
        let key = job.token.lock_key();
        let holder = match self.lock.try_acquire(&key, self.settings.lock_ttl).await {
            Ok(Some(holder)) => holder,
            Ok(None) => {
                debug!("Token already in flight");
                return Err(PipelineError::BusyDuplicate(job.token.to_string()));
            }
            Err(e) => return Err(PipelineError::Transient(e.to_string())),
        };

        let deadline = Deadline::new(&CancellationToken::new(), self.settings.job_timeout);
        let result = self.run(&job, deadline.token()).await;
        drop(deadline);

        if let Err(e) = self.lock.release(&key, holder).await {
            warn!(error = %e, "Failed to release token lock; it expires with its TTL");
        }

        match &result {
            Ok(outcome) => match &outcome.error {
                None => info!("Token processed"),
                Some(e) if job.options.is_spam_job => {
                    warn!(error = %e, kind = e.kind(), "Spam token processing failed")
                }
                Some(e) => error!(error = %e, kind = e.kind(), "Token processing failed"),
            },
            Err(e) if job.options.is_spam_job => warn!(error = %e, "Spam token run not persisted"),
            Err(e) => error!(error = %e, "Token run not persisted"),
        }

        result
    }

    async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<JobOutcome, PipelineError> {
        let mut run = Run {
            pipeline: PipelineMetadata::new(),
            metadata: TokenMetadata::new(),
            media: None,
        };
        let error = self.execute(job, &mut run, cancel).await.err();
        self.persist(job, run, error).await
    }

    async fn execute(
        &self,
        job: &Job,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let name = artifact_name(&job.token);

        // Metadata
        let timer = run.pipeline.start(Step::MetadataRetrieval);
        let (metadata, degraded) = match self.retrieve_metadata(job, cancel).await {
            Ok(found) => found,
            Err(e) => {
                run.pipeline.fail(timer, &e);
                return Err(e);
            }
        };
        run.metadata = metadata;
        if let Some(predicate) = &job.options.require_signed {
            if !predicate(&run.metadata) {
                let e = PipelineError::RequiredSignedToken;
                run.pipeline.fail(timer, &e);
                return Err(e);
            }
        }
        match degraded {
            Some(e) => run.pipeline.fail(timer, e),
            None => run.pipeline.succeed(timer),
        }
        check_cancelled(cancel)?;

        // Discovery
        let timer = run.pipeline.start(Step::MediaUrlDiscovery);
        let candidates = discovery::discover(&run.metadata, &job.options);
        if candidates.is_empty() {
            let e = PipelineError::BadToken("no media URLs in metadata".into());
            run.pipeline.fail(timer, &e);
            return Err(e);
        }
        let candidates = discovery::resolve(&self.classifier, candidates, cancel).await;
        run.pipeline.succeed(timer);
        check_cancelled(cancel)?;

        // Download
        let timer = run.pipeline.start(Step::Download);
        let (image, video) = {
            let stage = Deadline::new(cancel, self.settings.download_timeout);
            self.download(&candidates, &name, stage.token()).await
        };
        let failures: Vec<String> = [&image.error, &video.error]
            .into_iter()
            .flatten()
            .map(ToString::to_string)
            .collect();
        if failures.is_empty() {
            run.pipeline.succeed(timer);
        } else {
            run.pipeline.fail(timer, failures.join("; "));
        }
        check_cancelled(cancel)?;

        // Classification
        let timer = run.pipeline.start(Step::Classification);
        let (resolved, primary) = resolve_primary(&image, &video, &run.metadata);
        let image_required =
            job.options.require_image && candidates.image.is_some() && image.cached.is_none();
        let terminal = all_failed(&image, &video);
        let downloads = Downloads {
            image,
            video,
            resolved,
            primary,
        };
        if resolved.is_valid() {
            run.pipeline.succeed(timer);
        } else {
            run.pipeline.fail(timer, format!("unrecognized media type {resolved}"));
        }
        debug!(resolved = %resolved, primary = ?primary, "Media classified");

        if image_required {
            self.enforce_coherency(&name, &downloads, BTreeSet::new()).await?;
            return Err(PipelineError::ImageResultRequired);
        }
        if let Some(e) = terminal {
            // Nothing arrived; the metadata hint still describes the token
            if resolved.is_valid() {
                run.media = Some(assemble_media(&downloads, &Derived::default(), None));
            }
            self.enforce_coherency(&name, &downloads, BTreeSet::new()).await?;
            return Err(e);
        }

        // Transcode
        let timer = run.pipeline.start(Step::TranscodeThumbnail);
        let (mut derived, transcode_errors) = {
            let stage = Deadline::new(cancel, self.settings.transcode_timeout);
            self.derive(&downloads, &name, stage.token()).await
        };
        if transcode_errors.is_empty() {
            run.pipeline.succeed(timer);
        } else {
            run.pipeline.fail(timer, transcode_errors.join("; "));
        }
        check_cancelled(cancel)?;

        let profile_image = match job.options.profile_image_key.as_deref() {
            Some(key) => {
                let stage = Deadline::new(cancel, self.settings.download_timeout);
                self.cache_profile_image(&run.metadata, key, &name, stage.token())
                    .await
            }
            None => None,
        };
        if let Some(pfp) = &profile_image {
            derived.written.insert(pfp.kind);
        }

        run.media = Some(assemble_media(&downloads, &derived, profile_image));

        self.enforce_coherency(&name, &downloads, derived.written).await
    }

    /// Remove artifacts that no longer describe the classified media
    async fn enforce_coherency(
        &self,
        name: &str,
        downloads: &Downloads,
        mut written: BTreeSet<ArtifactKind>,
    ) -> Result<(), PipelineError> {
        written.extend(downloads.image.cached.as_ref().map(|a| a.kind));
        written.extend(downloads.video.cached.as_ref().map(|a| a.kind));
        let input = CoherencyInput {
            image: downloads.image.outcome(),
            video: downloads.video.outcome(),
            resolved: downloads.resolved,
            written,
        };
        self.artifacts
            .enforce_coherency(name, &input)
            .await
            .map(|_removed| ())
            .map_err(|e| PipelineError::Transient(format!("cache coherency: {e}")))
    }

    /// Metadata for the run, and the error to record when a fallback was used
    async fn retrieve_metadata(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<(TokenMetadata, Option<PipelineError>), PipelineError> {
        let starting = job.options.usable_starting_metadata();
        if !job.options.refresh_metadata {
            if let Some(metadata) = starting {
                return Ok((metadata.clone(), None));
            }
        }

        let error = match self.fetch_metadata(&job.token, cancel).await {
            Ok(metadata) if !metadata.is_empty() => return Ok((metadata, None)),
            Ok(_) => PipelineError::BadToken("provider returned empty metadata".into()),
            Err(e) => e,
        };
        warn!(error = %error, "Metadata fetch failed");

        if let Some(metadata) = starting {
            return Ok((metadata.clone(), Some(error)));
        }

        if !job.options.refresh_metadata && !matches!(error, PipelineError::Transient(_)) {
            match self
                .repository
                .get_token_metadata(job.token.chain, &job.token.contract)
                .await
            {
                Ok(Some(shared)) => {
                    info!("Using shared contract metadata");
                    return Ok((shared, Some(error)));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Shared contract metadata lookup failed"),
            }
        }

        Err(error)
    }

    async fn fetch_metadata(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenMetadata, PipelineError> {
        let capabilities = self.providers.for_chain(token.chain)?;
        let metadata = capabilities
            .metadata()?
            .token_metadata_by_identifiers(token, cancel)
            .await?;
        Ok(metadata)
    }

    async fn download(
        &self,
        candidates: &MediaCandidates,
        name: &str,
        cancel: &CancellationToken,
    ) -> (SlotResult, SlotResult) {
        tokio::join!(
            self.download_slot(
                Slot::Image,
                candidates.image.as_deref(),
                candidates.image_type,
                name,
                cancel
            ),
            self.download_slot(
                Slot::Video,
                candidates.animation.as_deref(),
                candidates.animation_type,
                name,
                cancel
            ),
        )
    }

    #[instrument(skip(self, name, cancel), fields(predicted = %predicted))]
    async fn download_slot(
        &self,
        slot: Slot,
        url: Option<&str>,
        predicted: MediaType,
        name: &str,
        cancel: &CancellationToken,
    ) -> SlotResult {
        let Some(url) = url else {
            return SlotResult::empty();
        };
        let mut result = SlotResult {
            url: Some(url.to_string()),
            media_type: predicted,
            ..SlotResult::default()
        };

        let fetched = match self.transport.fetch(url, cancel).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(error = %e, "Download failed");
                result.error = Some(e.into());
                return result;
            }
        };

        result.media_type = confirm(predicted, fetched.content_type.as_deref(), &fetched.body);
        result.body = Some(fetched.body.clone());

        let Some(plan) = cache_plan(slot, result.media_type, fetched.content_type.as_deref())
        else {
            debug!(media_type = %result.media_type, "Slot type is not cached");
            return result;
        };

        let body = match plan.content_encoding {
            Some(_) => match gzip(&fetched.body) {
                Ok(compressed) => compressed,
                Err(e) => {
                    result.error = Some(PipelineError::Transient(format!("gzip: {e}")));
                    return result;
                }
            },
            None => fetched.body,
        };

        match self
            .artifacts
            .write(plan.kind, name, body, &plan.content_type, plan.content_encoding)
            .await
        {
            Ok(written) => result.cached = Some(written),
            Err(e) => {
                warn!(error = %e, "Caching download failed");
                result.error = Some(PipelineError::Transient(format!("object store: {e}")));
            }
        }
        result
    }

    /// Thumbnail, live preview and dimensions for the primary media
    async fn derive(
        &self,
        downloads: &Downloads,
        name: &str,
        cancel: &CancellationToken,
    ) -> (Derived, Vec<String>) {
        let mut derived = Derived::default();
        let mut errors = Vec::new();
        let Some(body) = downloads.primary().body.clone() else {
            return (derived, errors);
        };

        match downloads.resolved {
            MediaType::Video => {
                let (thumbnail, preview, dimensions) = tokio::join!(
                    self.write_derived(
                        ArtifactKind::Thumbnail,
                        name,
                        "image/jpeg",
                        self.transcoder.extract_thumbnail(body.clone(), cancel)
                    ),
                    self.write_derived(
                        ArtifactKind::LiveRender,
                        name,
                        "video/mp4",
                        self.transcoder.make_live_preview(body.clone(), cancel)
                    ),
                    self.transcoder.probe_dimensions(body.clone(), cancel),
                );
                derived.dimensions = dimensions;
                match thumbnail {
                    Ok(artifact) => derived.thumbnail = Some(artifact),
                    Err(e) => errors.push(e),
                }
                match preview {
                    Ok(artifact) => derived.live_render = Some(artifact),
                    Err(e) => errors.push(e),
                }
            }
            MediaType::Svg => {
                match self
                    .artifacts
                    .write(ArtifactKind::Svg, name, body.clone(), "image/svg+xml", None)
                    .await
                {
                    Ok(artifact) => {
                        derived.written.insert(artifact.kind);
                    }
                    Err(e) => errors.push(format!("svg: {e}")),
                }
                derived.dimensions = inline_dimensions(MediaType::Svg, &body);
            }
            resolved => {
                derived.dimensions = inline_dimensions(resolved, &body);
                if !derived.dimensions.is_valid() && resolved.is_still() {
                    derived.dimensions = self.transcoder.probe_dimensions(body, cancel).await;
                }
            }
        }

        if let Some(artifact) = &derived.thumbnail {
            derived.written.insert(artifact.kind);
        }
        if let Some(artifact) = &derived.live_render {
            derived.written.insert(artifact.kind);
        }
        if !derived.dimensions.is_valid() {
            info!(media_type = %downloads.resolved, "No dimensions found");
        }

        (derived, errors)
    }

    async fn write_derived(
        &self,
        kind: ArtifactKind,
        name: &str,
        content_type: &str,
        produce: impl std::future::Future<Output = Result<Bytes, crate::media::TranscodeError>>,
    ) -> Result<WrittenArtifact, String> {
        let output = produce.await.map_err(|e| format!("{kind}: {e}"))?;
        self.artifacts
            .write(kind, name, output, content_type, None)
            .await
            .map_err(|e| format!("{kind}: {e}"))
    }

    /// Best effort; failures only log
    async fn cache_profile_image(
        &self,
        metadata: &TokenMetadata,
        key: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Option<WrittenArtifact> {
        let url = metadata.get_str(key)?;
        let predicted = self.classifier.predict(url, cancel).await;
        let fetched = match self.transport.fetch(url, cancel).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(error = %e, key, "Profile image download failed");
                return None;
            }
        };

        let media_type = confirm(predicted, fetched.content_type.as_deref(), &fetched.body);
        let plan = cache_plan(Slot::Image, media_type, fetched.content_type.as_deref());
        let Some(plan) = plan else {
            warn!(media_type = %media_type, key, "Profile image is not an image");
            return None;
        };

        match self
            .artifacts
            .write(
                ArtifactKind::ProfileImage,
                name,
                fetched.body,
                &plan.content_type,
                None,
            )
            .await
        {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(error = %e, key, "Caching profile image failed");
                None
            }
        }
    }

    async fn persist(
        &self,
        job: &Job,
        mut run: Run,
        error: Option<PipelineError>,
    ) -> Result<JobOutcome, PipelineError> {
        // Recorded before the write so the row carries its own final state
        let timer = run.pipeline.start(Step::Persist);
        run.pipeline.succeed(timer);

        let properties = TokenProperties::derive(&run.metadata, run.media.as_ref());
        let results = PipelineResults {
            run_id: job.run_id,
            token: job.token.clone(),
            cause: job.cause.to_string(),
            name: run.metadata.name().map(str::to_string),
            description: run.metadata.description().map(str::to_string),
            metadata: run.metadata,
            properties,
            pipeline_metadata: run.pipeline.clone(),
            media: run.media,
            processor_version: self.settings.processor_version.clone(),
            error_kind: error.as_ref().map(|e| e.kind().to_string()),
        };

        let insert = tokio::time::timeout(
            self.settings.persist_timeout,
            self.repository.insert_token_pipeline_results(results),
        )
        .await;

        let media = match insert {
            Ok(Ok(media)) => media,
            Ok(Err(e)) => return Err(PipelineError::Fatal(e.to_string())),
            Err(_) => return Err(PipelineError::Fatal("persisting results timed out".into())),
        };

        Ok(JobOutcome {
            run_id: job.run_id,
            media,
            properties,
            pipeline_metadata: run.pipeline,
            error,
        })
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Transient("job deadline exceeded".into()));
    }
    Ok(())
}

fn assemble_media(
    downloads: &Downloads,
    derived: &Derived,
    profile_image: Option<WrittenArtifact>,
) -> TokenMedia {
    let (primary, secondary) = match downloads.primary {
        Slot::Image => (&downloads.image, &downloads.video),
        Slot::Video => (&downloads.video, &downloads.image),
    };

    let media_url = primary.url.clone().or_else(|| secondary.url.clone());
    let thumbnail_url = match downloads.primary {
        Slot::Video if primary.url.is_some() => downloads.image.url.clone(),
        _ => None,
    };
    let cached_thumbnail_url = derived.thumbnail.as_ref().map(|a| a.url.clone()).or_else(|| {
        match downloads.primary {
            Slot::Video => downloads.image.cached.as_ref().map(|a| a.url.clone()),
            Slot::Image => None,
        }
    });

    TokenMedia {
        media_type: downloads.resolved,
        media_url,
        thumbnail_url,
        cached_media_url: primary.cached.as_ref().map(|a| a.url.clone()),
        cached_thumbnail_url,
        live_render_url: derived.live_render.as_ref().map(|a| a.url.clone()),
        profile_image_url: profile_image.map(|a| a.url),
        dimensions: derived.dimensions,
    }
}
