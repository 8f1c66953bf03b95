//! Token data providers
//!
//! Each upstream indexer is an adapter exposing some of the capability traits
//! below. A chain's [`ProviderCapabilities`] is a record of capability slots,
//! each filled by an adapter or by a combinator wrapping two of them (see
//! [`fallback`]).

pub mod alchemy;
pub mod fallback;
pub mod indexer;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use fallback::{EvalFallback, FailureFallback, TokenEval};
pub use registry::ProviderRegistry;

/// Pages buffered between a streaming producer and its consumer
pub const STREAM_BUFFER: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider does not index the contract or token
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient provider failure: {0}")]
    Transient(String),

    #[error("Permanent provider failure: {0}")]
    Permanent(String),

    #[error("Capability not supported: {0}")]
    Unsupported(&'static str),

    #[error("Provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Cancelled)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            ProviderError::Permanent(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Map a non-success provider status to an error
pub(crate) fn status_error(status: reqwest::StatusCode, context: &str) -> ProviderError {
    let message = format!("{context} answered {status}");
    if status == reqwest::StatusCode::NOT_FOUND {
        ProviderError::NotFound(message)
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

/// Race a provider call against cancellation
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = call => result,
    }
}

/// Human readable fields of a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDescriptors {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl TokenDescriptors {
    pub fn from_metadata(metadata: &TokenMetadata) -> Self {
        Self {
            name: metadata.name().map(str::to_string),
            description: metadata.description().map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

/// Media URLs as reported by a provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUrls {
    pub image: Option<String>,
    pub animation: Option<String>,
}

impl MediaUrls {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.animation.is_none()
    }
}

/// A token as one provider sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub identifier: TokenIdentifier,
    pub owner: Option<Address>,
    pub descriptors: TokenDescriptors,
    pub metadata: TokenMetadata,
    pub media: MediaUrls,
}

impl Token {
    pub fn new(identifier: TokenIdentifier) -> Self {
        Self {
            identifier,
            owner: None,
            descriptors: TokenDescriptors::default(),
            metadata: TokenMetadata::new(),
            media: MediaUrls::default(),
        }
    }

    pub fn has_metadata(&self) -> bool {
        !self.metadata.is_empty()
    }
}

/// Pages of tokens produced incrementally.
///
/// Pages arrive in producer order; errors travel on their own channel. Both
/// channels close when the producer finishes or is cancelled.
pub struct TokenStream {
    pages: mpsc::Receiver<Vec<Token>>,
    errors: mpsc::Receiver<ProviderError>,
    pages_open: bool,
    errors_open: bool,
}

/// Producer half of a [`TokenStream`]
#[derive(Clone)]
pub struct TokenStreamSender {
    pub pages: mpsc::Sender<Vec<Token>>,
    pub errors: mpsc::Sender<ProviderError>,
}

impl TokenStream {
    pub fn channel() -> (TokenStreamSender, TokenStream) {
        let (page_tx, page_rx) = mpsc::channel(STREAM_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(1);
        (
            TokenStreamSender {
                pages: page_tx,
                errors: error_tx,
            },
            TokenStream {
                pages: page_rx,
                errors: error_rx,
                pages_open: true,
                errors_open: true,
            },
        )
    }

    /// A stream that fails immediately
    pub fn failed(error: ProviderError) -> TokenStream {
        let (tx, stream) = Self::channel();
        // Capacity is one and nothing else has sent.
        let _ = tx.errors.try_send(error);
        stream
    }

    /// Next page or error; `None` once both channels are closed
    pub async fn next(&mut self) -> Option<Result<Vec<Token>, ProviderError>> {
        loop {
            if !self.pages_open && !self.errors_open {
                return None;
            }
            tokio::select! {
                biased;
                error = self.errors.recv(), if self.errors_open => match error {
                    Some(e) => return Some(Err(e)),
                    None => self.errors_open = false,
                },
                page = self.pages.recv(), if self.pages_open => match page {
                    Some(page) => return Some(Ok(page)),
                    None => self.pages_open = false,
                },
            }
        }
    }

    /// Drain every page, stopping at the first error
    pub async fn collect(mut self) -> Result<Vec<Token>, ProviderError> {
        let mut tokens = Vec::new();
        while let Some(page) = self.next().await {
            tokens.extend(page?);
        }
        Ok(tokens)
    }
}

#[async_trait]
pub trait TokensByOwner: Send + Sync {
    async fn tokens_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError>;
}

#[async_trait]
pub trait TokensIncrementalByOwner: Send + Sync {
    async fn tokens_incremental_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> TokenStream;
}

#[async_trait]
pub trait TokensByContract: Send + Sync {
    async fn tokens_by_contract(
        &self,
        chain: Chain,
        contract: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError>;
}

#[async_trait]
pub trait TokensByContractAndOwner: Send + Sync {
    async fn tokens_by_contract_and_owner(
        &self,
        chain: Chain,
        contract: &Address,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError>;
}

#[async_trait]
pub trait TokenByIdentifiersAndOwner: Send + Sync {
    async fn token_by_identifiers_and_owner(
        &self,
        token: &TokenIdentifier,
        owner: Option<&Address>,
        cancel: &CancellationToken,
    ) -> Result<Token, ProviderError>;
}

#[async_trait]
pub trait TokenMetadataByIdentifiers: Send + Sync {
    async fn token_metadata_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenMetadata, ProviderError>;
}

#[async_trait]
pub trait TokenDescriptorsByIdentifiers: Send + Sync {
    async fn token_descriptors_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenDescriptors, ProviderError>;
}

#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve_name(
        &self,
        chain: Chain,
        address: &Address,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError>;
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_signature(
        &self,
        chain: Chain,
        address: &Address,
        message: &str,
        signature: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ProviderError>;
}

/// The capabilities available for one chain
#[derive(Clone, Default)]
pub struct ProviderCapabilities {
    pub tokens_by_owner: Option<Arc<dyn TokensByOwner>>,
    pub tokens_incremental_by_owner: Option<Arc<dyn TokensIncrementalByOwner>>,
    pub tokens_by_contract: Option<Arc<dyn TokensByContract>>,
    pub tokens_by_contract_and_owner: Option<Arc<dyn TokensByContractAndOwner>>,
    pub token_by_identifiers_and_owner: Option<Arc<dyn TokenByIdentifiersAndOwner>>,
    pub token_metadata_by_identifiers: Option<Arc<dyn TokenMetadataByIdentifiers>>,
    pub token_descriptors_by_identifiers: Option<Arc<dyn TokenDescriptorsByIdentifiers>>,
    pub name_resolver: Option<Arc<dyn NameResolver>>,
    pub signature_verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl ProviderCapabilities {
    /// Every capability `provider` implements
    pub fn full<P>(provider: Arc<P>) -> Self
    where
        P: TokensByOwner
            + TokensIncrementalByOwner
            + TokensByContract
            + TokensByContractAndOwner
            + TokenByIdentifiersAndOwner
            + TokenMetadataByIdentifiers
            + TokenDescriptorsByIdentifiers
            + 'static,
    {
        Self {
            tokens_by_owner: Some(provider.clone()),
            tokens_incremental_by_owner: Some(provider.clone()),
            tokens_by_contract: Some(provider.clone()),
            tokens_by_contract_and_owner: Some(provider.clone()),
            token_by_identifiers_and_owner: Some(provider.clone()),
            token_metadata_by_identifiers: Some(provider.clone()),
            token_descriptors_by_identifiers: Some(provider),
            name_resolver: None,
            signature_verifier: None,
        }
    }

    pub fn metadata(&self) -> Result<&Arc<dyn TokenMetadataByIdentifiers>, ProviderError> {
        self.token_metadata_by_identifiers
            .as_ref()
            .ok_or(ProviderError::Unsupported("TokenMetadataByIdentifiers"))
    }

    pub fn descriptors(&self) -> Result<&Arc<dyn TokenDescriptorsByIdentifiers>, ProviderError> {
        self.token_descriptors_by_identifiers
            .as_ref()
            .ok_or(ProviderError::Unsupported("TokenDescriptorsByIdentifiers"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn token(id: &str) -> Token {
        Token::new(
            TokenIdentifier::parse(
                Chain::Ethereum,
                "0x0000000000000000000000000000000000000001",
                id,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_stream_yields_pages_in_order() {
        let (tx, stream) = TokenStream::channel();
        tokio::spawn(async move {
            for id in ["1", "2", "3"] {
                let _ = tx.pages.send(vec![token(id)]).await;
            }
        });

        let tokens = stream.collect().await.unwrap();
        let ids: Vec<String> = tokens
            .iter()
            .map(|t| t.identifier.token_id.to_string())
            .collect();
        assert_eq!(ids, vec!["0x1", "0x2", "0x3"]);
    }

    #[tokio::test]
    async fn test_failed_stream() {
        let mut stream = TokenStream::failed(ProviderError::Transient("down".into()));
        assert!(matches!(stream.next().await, Some(Err(ProviderError::Transient(_)))));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(reqwest::StatusCode::NOT_FOUND, "x"),
            ProviderError::NotFound(_)
        ));
        assert!(status_error(reqwest::StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED, "x"),
            ProviderError::Permanent(_)
        ));
    }
}
