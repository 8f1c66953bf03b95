//! Common test utilities for token media integration tests
//!
//! - [`Harness`]: a [`TokenProcessor`] wired to a wiremock media origin, an
//!   in-memory bucket, repository and lock, and a fake transcoder
//! - [`TestPostgres`]: a PostgreSQL container with migrations applied
#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokenmedia_common::{Chain, Dimensions, TokenIdentifier, TokenMetadata};
use tokenmedia_server::{
    config::{MediaConfig, DEFAULT_ARWEAVE_URL, DEFAULT_MAX_DOWNLOAD_BYTES},
    db::{MemoryRepository, TokenRepository},
    media::{TranscodeError, Transcoder, Transport},
    pipeline::{
        Job, JobCause, JobOptions, MemoryTokenLock, ProcessorSettings, TokenLock, TokenProcessor,
    },
    providers::ProviderRegistry,
    storage::{
        artifacts::{artifact_name, ArtifactKind, ArtifactWriter},
        memory::MemoryObjectStore,
        ObjectStore,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const STORE_HOST: &str = "https://storage.test/token-content";

pub const THUMBNAIL_BYTES: &[u8] = b"\xFF\xD8\xFF\xE0thumbnail";
pub const PREVIEW_BYTES: &[u8] = b"\x00\x00\x00\x18ftypisompreview";
pub const PROBED: Dimensions = Dimensions {
    width: 1280,
    height: 720,
};

/// A PNG of the given size
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    image::RgbImage::new(width, height)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

/// A BMP of the given size
pub fn bmp(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    image::RgbImage::new(width, height)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Bmp)
        .unwrap();
    out
}

/// A binary glTF header followed by padding
pub fn glb() -> Vec<u8> {
    let mut body = b"glTF\x02\x00\x00\x00".to_vec();
    body.extend_from_slice(&[0u8; 128]);
    body
}

/// Enough of an MP4 to sniff as video
pub fn mp4() -> Vec<u8> {
    let mut body = b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom".to_vec();
    body.extend_from_slice(&[0u8; 64]);
    body
}

pub fn token() -> TokenIdentifier {
    TokenIdentifier::parse(Chain::Ethereum, "0x00000000000000000000000000000000000000aa", "1").unwrap()
}

pub fn metadata(json: serde_json::Value) -> TokenMetadata {
    TokenMetadata::from_value(json).unwrap()
}

/// Transcoder returning canned outputs and counting calls
#[derive(Debug, Default)]
pub struct FakeTranscoder {
    pub thumbnails: AtomicUsize,
    pub previews: AtomicUsize,
    pub probes: AtomicUsize,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn extract_thumbnail(
        &self,
        _input: Bytes,
        _cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError> {
        self.thumbnails.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(THUMBNAIL_BYTES))
    }

    async fn make_live_preview(
        &self,
        _input: Bytes,
        _cancel: &CancellationToken,
    ) -> Result<Bytes, TranscodeError> {
        self.previews.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(PREVIEW_BYTES))
    }

    async fn probe_dimensions(&self, _input: Bytes, _cancel: &CancellationToken) -> Dimensions {
        self.probes.fetch_add(1, Ordering::SeqCst);
        PROBED
    }
}

/// A processor over in-memory collaborators and a mock media origin
pub struct Harness {
    pub origin: MockServer,
    pub store: Arc<MemoryObjectStore>,
    pub repository: Arc<MemoryRepository>,
    pub lock: Arc<MemoryTokenLock>,
    pub transcoder: Arc<FakeTranscoder>,
    pub processor: Arc<TokenProcessor>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_registry(ProviderRegistry::new()).await
    }

    pub async fn with_registry(registry: ProviderRegistry) -> Self {
        Self::build(registry, ProcessorSettings::default()).await
    }

    /// Processor with custom deadlines
    pub async fn with_settings(settings: ProcessorSettings) -> Self {
        Self::build(ProviderRegistry::new(), settings).await
    }

    async fn build(registry: ProviderRegistry, settings: ProcessorSettings) -> Self {
        let origin = MockServer::start().await;
        let media = MediaConfig {
            ipfs_url: origin.uri(),
            arweave_url: DEFAULT_ARWEAVE_URL.to_string(),
            ffmpeg_path: None,
            ffprobe_path: None,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
        };

        let store = Arc::new(MemoryObjectStore::new(STORE_HOST));
        let repository = Arc::new(MemoryRepository::new());
        let lock = Arc::new(MemoryTokenLock::new());
        let transcoder = Arc::new(FakeTranscoder::default());

        let object_store: Arc<dyn ObjectStore> = store.clone();
        let repo: Arc<dyn TokenRepository> = repository.clone();
        let token_lock: Arc<dyn TokenLock> = lock.clone();
        let processor = TokenProcessor::new(
            Arc::new(registry),
            Arc::new(Transport::new(reqwest::Client::new(), &media)),
            transcoder.clone(),
            ArtifactWriter::without_purge(object_store),
            repo,
            token_lock,
        )
        .with_settings(settings);

        Self {
            origin,
            store,
            repository,
            lock,
            transcoder,
            processor: Arc::new(processor),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.origin.uri(), path)
    }

    /// Serve `body` at `path` from the origin
    pub async fn serve(&self, at: &str, content_type: &str, body: Vec<u8>) {
        self.serve_delayed(at, content_type, body, Duration::ZERO).await;
    }

    pub async fn serve_delayed(&self, at: &str, content_type: &str, body: Vec<u8>, delay: Duration) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", content_type)
                    .set_body_bytes(body)
                    .set_delay(delay),
            )
            .mount(&self.origin)
            .await;
    }

    pub fn job(&self, options: JobOptions) -> Job {
        Job::new(token(), JobCause::Refresh, options)
    }

    pub fn key(kind: ArtifactKind) -> String {
        kind.object_key(&artifact_name(&token()))
    }

    pub fn has(&self, kind: ArtifactKind) -> bool {
        self.store.contains(&Self::key(kind))
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations pre-applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { container, pool })
    }

    /// Container, or `None` when Docker is not available
    pub async fn try_start() -> Option<Self> {
        match Self::start().await {
            Ok(pg) => Some(pg),
            Err(e) => {
                eprintln!("Skipping PostgreSQL test: {:#}", e);
                None
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}
