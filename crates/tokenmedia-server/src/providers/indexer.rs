//! Adapter for the in-house chain indexer at `INDEXER_HOST`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
    cancellable, status_error, MediaUrls, NameResolver, ProviderError, SignatureVerifier, Token,
    TokenByIdentifiersAndOwner, TokenDescriptors, TokenDescriptorsByIdentifiers,
    TokenMetadataByIdentifiers,
};

#[derive(Debug, Deserialize)]
struct IndexerToken {
    owner: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    metadata: Value,
    image_url: Option<String>,
    animation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NameResponse {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    chain: Chain,
    address: &'a Address,
    message: &'a str,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
}

#[derive(Clone)]
pub struct IndexerProvider {
    client: reqwest::Client,
    host: String,
}

impl IndexerProvider {
    pub fn new(client: reqwest::Client, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_token(
        &self,
        token: &TokenIdentifier,
        owner: Option<&Address>,
    ) -> Result<Token, ProviderError> {
        let url = format!(
            "{}/v1/tokens/{}/{}/{}",
            self.host, token.chain, token.contract, token.token_id
        );
        let mut request = self.client.get(&url);
        if let Some(owner) = owner {
            request = request.query(&[("owner", owner.as_str())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "indexer token lookup"));
        }
        let found: IndexerToken = response.json().await?;

        let metadata = TokenMetadata::from_value(found.metadata).unwrap_or_default();
        let owner = match found.owner.as_deref().map(Address::parse) {
            Some(Ok(address)) => Some(address),
            _ => owner.cloned(),
        };

        Ok(Token {
            identifier: token.clone(),
            owner,
            descriptors: TokenDescriptors {
                name: found.name.or_else(|| metadata.name().map(str::to_string)),
                description: found
                    .description
                    .or_else(|| metadata.description().map(str::to_string)),
            },
            media: MediaUrls {
                image: found.image_url,
                animation: found.animation_url,
            },
            metadata,
        })
    }
}

#[async_trait]
impl TokenByIdentifiersAndOwner for IndexerProvider {
    #[instrument(skip(self, cancel), fields(token = %token))]
    async fn token_by_identifiers_and_owner(
        &self,
        token: &TokenIdentifier,
        owner: Option<&Address>,
        cancel: &CancellationToken,
    ) -> Result<Token, ProviderError> {
        cancellable(cancel, self.fetch_token(token, owner)).await
    }
}

#[async_trait]
impl TokenMetadataByIdentifiers for IndexerProvider {
    #[instrument(skip(self, cancel), fields(token = %token))]
    async fn token_metadata_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenMetadata, ProviderError> {
        let found = cancellable(cancel, self.fetch_token(token, None)).await?;
        if found.metadata.is_empty() {
            return Err(ProviderError::NotFound(format!("no metadata indexed for {token}")));
        }
        Ok(found.metadata)
    }
}

#[async_trait]
impl TokenDescriptorsByIdentifiers for IndexerProvider {
    async fn token_descriptors_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenDescriptors, ProviderError> {
        let found = cancellable(cancel, self.fetch_token(token, None)).await?;
        Ok(found.descriptors)
    }
}

#[async_trait]
impl NameResolver for IndexerProvider {
    async fn resolve_name(
        &self,
        chain: Chain,
        address: &Address,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        cancellable(cancel, async {
            let url = format!("{}/v1/names/{}/{}", self.host, chain, address);
            let response = self.client.get(&url).send().await?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(status_error(response.status(), "indexer name lookup"));
            }
            let body: NameResponse = response.json().await?;
            Ok(body.name.filter(|n| !n.is_empty()))
        })
        .await
    }
}

#[async_trait]
impl SignatureVerifier for IndexerProvider {
    async fn verify_signature(
        &self,
        chain: Chain,
        address: &Address,
        message: &str,
        signature: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ProviderError> {
        cancellable(cancel, async {
            let url = format!("{}/v1/signatures/verify", self.host);
            let response = self
                .client
                .post(&url)
                .json(&VerifyRequest {
                    chain,
                    address,
                    message,
                    signature,
                })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(status_error(response.status(), "indexer signature check"));
            }
            let body: VerifyResponse = response.json().await?;
            Ok(body.valid)
        })
        .await
    }
}
