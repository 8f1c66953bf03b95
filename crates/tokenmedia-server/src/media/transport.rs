//! Byte transports for media URIs
//!
//! A URI is parsed into a [`MediaSource`] and opened as a [`MediaStream`]:
//!
//! - `http(s)://` is fetched directly
//! - `ipfs://CID[/path]`, gateway URLs (`/ipfs/CID`, `CID.ipfs.host`) and bare
//!   CIDs go through the configured IPFS gateway
//! - `ar://tx` goes through the Arweave gateway
//! - `data:` URIs and literal SVG/JSON documents are served from memory

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{header, StatusCode};
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::config::MediaConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for any single request; stage deadlines are usually shorter.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const USER_AGENT: &str = concat!("tokenmedia/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Transient fetch failure: {0}")]
    Transient(String),

    #[error("Permanent fetch failure: {0}")]
    Permanent(String),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Where the bytes of a media URI come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Http(Url),
    /// `<cid>[/path]`
    Ipfs(String),
    /// `<transaction>[/path]`
    Arweave(String),
    Data {
        content_type: Option<String>,
        base64: bool,
        body: Bytes,
    },
    InlineSvg(String),
    InlineJson(String),
}

impl MediaSource {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FetchError::Permanent("empty media URI".into()));
        }

        let lower = trimmed.to_ascii_lowercase();

        if lower.starts_with("<svg") || (lower.starts_with("<?xml") && lower.contains("<svg")) {
            return Ok(MediaSource::InlineSvg(trimmed.to_string()));
        }
        if trimmed.starts_with('{') {
            return Ok(MediaSource::InlineJson(trimmed.to_string()));
        }
        if lower.starts_with("data:") {
            return parse_data_uri(trimmed);
        }
        if lower.starts_with("ipfs://") {
            let rest = &trimmed["ipfs://".len()..];
            let rest = rest.strip_prefix("ipfs/").unwrap_or(rest);
            return non_empty(rest).map(MediaSource::Ipfs);
        }
        if lower.starts_with("ar://") {
            return non_empty(&trimmed["ar://".len()..]).map(MediaSource::Arweave);
        }
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(trimmed)
                .map_err(|e| FetchError::Permanent(format!("invalid URL {trimmed}: {e}")))?;
            return Ok(ipfs_gateway_path(&url)
                .map(MediaSource::Ipfs)
                .unwrap_or(MediaSource::Http(url)));
        }
        if looks_like_cid(trimmed) {
            return Ok(MediaSource::Ipfs(trimmed.to_string()));
        }

        Err(FetchError::Permanent(format!("unsupported media URI: {}", truncate(trimmed))))
    }

    /// True for sources that can answer a `HEAD` over the network
    pub fn supports_head(&self) -> bool {
        matches!(self, MediaSource::Http(_) | MediaSource::Ipfs(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            MediaSource::Http(_) | MediaSource::Ipfs(_) | MediaSource::Arweave(_)
        )
    }
}

fn non_empty(rest: &str) -> Result<String, FetchError> {
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        Err(FetchError::Permanent("URI has no content identifier".into()))
    } else {
        Ok(rest.to_string())
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(64).collect()
}

/// `https://gw/ipfs/<cid>/x` or `https://<cid>.ipfs.gw/x` as `<cid>/x`
fn ipfs_gateway_path(url: &Url) -> Option<String> {
    let path = url.path();
    if let Some(idx) = path.find("/ipfs/") {
        let rest = path[idx + "/ipfs/".len()..].trim_matches('/');
        if !rest.is_empty() {
            return Some(rest.to_string());
        }
    }

    let host = url.host_str()?;
    let (cid, _) = host.split_once(".ipfs.")?;
    let rest = path.trim_matches('/');
    if rest.is_empty() {
        Some(cid.to_string())
    } else {
        Some(format!("{cid}/{rest}"))
    }
}

fn looks_like_cid(s: &str) -> bool {
    let head = s.split('/').next().unwrap_or(s);
    let alnum = head.chars().all(|c| c.is_ascii_alphanumeric());
    alnum && ((head.starts_with("Qm") && head.len() == 46) || (head.starts_with("bafy") && head.len() > 50))
}

fn parse_data_uri(raw: &str) -> Result<MediaSource, FetchError> {
    let rest = &raw["data:".len()..];
    let (header_part, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::Permanent("data URI without payload".into()))?;

    let mut params = header_part.split(';').map(str::trim);
    let content_type = params
        .next()
        .filter(|mime| mime.contains('/'))
        .map(|mime| mime.to_ascii_lowercase());
    let base64 = header_part
        .split(';')
        .any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let body = if base64 {
        decode_base64(payload)?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };

    Ok(MediaSource::Data {
        content_type,
        base64,
        body: Bytes::from(body),
    })
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, FetchError> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let compact = urlencoding::decode_binary(compact.as_bytes());
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&compact).ok())
        .ok_or_else(|| FetchError::Permanent("invalid base64 in data URI".into()))
}

/// Headers describing a media body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaHeaders {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// An open media body plus its declared headers
pub struct MediaStream {
    pub headers: MediaHeaders,
    body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl MediaStream {
    pub fn from_bytes(body: Bytes, content_type: Option<String>) -> Self {
        Self {
            headers: MediaHeaders {
                content_type,
                content_length: Some(body.len() as u64),
            },
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// Read at most `n` bytes and drop the rest of the body
    pub async fn read_prefix(mut self, n: usize) -> Result<Bytes, FetchError> {
        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            match self.body.next().await {
                Some(chunk) => buf.extend_from_slice(&chunk?),
                None => break,
            }
        }
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Read the whole body, failing once it exceeds `limit` bytes
    pub async fn read_to_end(mut self, limit: u64) -> Result<Bytes, FetchError> {
        if let Some(declared) = self.headers.content_length {
            if declared > limit {
                return Err(FetchError::Permanent(format!(
                    "declared length {declared} exceeds limit {limit}"
                )));
            }
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
            if buf.len() as u64 > limit {
                return Err(FetchError::Permanent(format!("body exceeds limit {limit}")));
            }
        }
        Ok(buf.freeze())
    }
}

/// A fully read media body
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Build the shared HTTP client used for media origins.
///
/// Idle connections are not pooled: origins are numerous and rarely reused.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()
}

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    ipfs_base: String,
    arweave_base: String,
    max_bytes: u64,
}

impl Transport {
    pub fn new(client: reqwest::Client, config: &MediaConfig) -> Self {
        Self {
            client,
            ipfs_base: config.ipfs_url.trim_end_matches('/').to_string(),
            arweave_base: config.arweave_url.trim_end_matches('/').to_string(),
            max_bytes: config.max_download_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Network URL a remote source is fetched from
    pub fn remote_url(&self, source: &MediaSource) -> Result<Option<Url>, FetchError> {
        let raw = match source {
            MediaSource::Http(url) => return Ok(Some(url.clone())),
            MediaSource::Ipfs(path) => format!("{}/ipfs/{}", self.ipfs_base, path),
            MediaSource::Arweave(path) => format!("{}/{}", self.arweave_base, path),
            _ => return Ok(None),
        };
        Url::parse(&raw)
            .map(Some)
            .map_err(|e| FetchError::Permanent(format!("invalid gateway URL {raw}: {e}")))
    }

    /// Headers only
    #[instrument(skip(self, cancel), fields(uri = %truncate(raw)))]
    pub async fn head(&self, raw: &str, cancel: &CancellationToken) -> Result<MediaHeaders, FetchError> {
        let source = MediaSource::parse(raw)?;
        match self.remote_url(&source)? {
            Some(url) => {
                let request = self.client.head(url.clone()).send();
                let response = tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    response = request => response.map_err(classify_reqwest_error)?,
                };
                check_status(response.status(), &url)?;
                Ok(response_headers(&response))
            }
            None => Ok(local_stream(source).headers),
        }
    }

    /// Open the body as a stream
    #[instrument(skip(self, cancel), fields(uri = %truncate(raw)))]
    pub async fn open(&self, raw: &str, cancel: &CancellationToken) -> Result<MediaStream, FetchError> {
        let source = MediaSource::parse(raw)?;
        let Some(url) = self.remote_url(&source)? else {
            return Ok(local_stream(source));
        };

        debug!(url = %url, "Opening media stream");

        let request = self.client.get(url.clone()).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request => response.map_err(classify_reqwest_error)?,
        };
        check_status(response.status(), &url)?;

        let headers = response_headers(&response);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_reqwest_error))
            .boxed();

        Ok(MediaStream { headers, body })
    }

    /// Open and read the whole body within the size limit
    pub async fn fetch(&self, raw: &str, cancel: &CancellationToken) -> Result<FetchedMedia, FetchError> {
        let stream = self.open(raw, cancel).await?;
        let content_type = stream.headers.content_type.clone();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            body = stream.read_to_end(self.max_bytes) => body?,
        };
        Ok(FetchedMedia { body, content_type })
    }
}

fn local_stream(source: MediaSource) -> MediaStream {
    match source {
        MediaSource::Data {
            content_type, body, ..
        } => MediaStream::from_bytes(body, content_type),
        MediaSource::InlineSvg(svg) => {
            MediaStream::from_bytes(Bytes::from(svg), Some("image/svg+xml".to_string()))
        }
        MediaSource::InlineJson(json) => {
            MediaStream::from_bytes(Bytes::from(json), Some("application/json".to_string()))
        }
        MediaSource::Http(_) | MediaSource::Ipfs(_) | MediaSource::Arweave(_) => {
            MediaStream::from_bytes(Bytes::new(), None)
        }
    }
}

fn response_headers(response: &reqwest::Response) -> MediaHeaders {
    MediaHeaders {
        content_type: response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        content_length: response.content_length(),
    }
}

fn check_status(status: StatusCode, url: &Url) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{url} answered {status}");
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => FetchError::Transient(message),
        s if s.is_server_error() => FetchError::Transient(message),
        _ => FetchError::Permanent(message),
    })
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if is_dns_failure(&err) {
        return FetchError::NotFound(err.to_string());
    }
    if err.is_decode() || err.is_builder() || err.is_redirect() {
        return FetchError::Permanent(err.to_string());
    }
    FetchError::Transient(err.to_string())
}

/// Name resolution failures (NXDOMAIN) surface only in the error chain text.
fn is_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
            || text.contains("nodename nor servname")
            || text.contains("no such host")
        {
            return true;
        }
        source = cause.source();
    }
    false
}
