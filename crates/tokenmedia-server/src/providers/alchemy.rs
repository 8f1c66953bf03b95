//! Alchemy NFT API (v3) adapter
//!
//! One instance serves one chain; the base URL already carries the API key,
//! e.g. `https://eth-mainnet.g.alchemy.com/nft/v3/<key>`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{
    cancellable, status_error, MediaUrls, ProviderError, Token, TokenByIdentifiersAndOwner,
    TokenDescriptors, TokenDescriptorsByIdentifiers, TokenMetadataByIdentifiers, TokenStream,
    TokensByContract, TokensByContractAndOwner, TokensByOwner, TokensIncrementalByOwner,
};

const PAGE_SIZE: u32 = 100;

/// Pages fetched before a listing is cut short
const MAX_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnedNftsResponse {
    #[serde(default)]
    owned_nfts: Vec<AlchemyNft>,
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractNftsResponse {
    #[serde(default)]
    nfts: Vec<AlchemyNft>,
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyNft {
    contract: AlchemyContract,
    token_id: String,
    name: Option<String>,
    description: Option<String>,
    image: Option<AlchemyMedia>,
    animation: Option<AlchemyMedia>,
    raw: Option<AlchemyRaw>,
}

#[derive(Debug, Deserialize)]
struct AlchemyContract {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlchemyMedia {
    original_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlchemyRaw {
    #[serde(default)]
    metadata: Value,
    error: Option<String>,
}

impl AlchemyNft {
    fn into_token(self, chain: Chain, owner: Option<&Address>) -> Option<Token> {
        let identifier =
            match TokenIdentifier::parse(chain, &self.contract.address, &self.token_id) {
                Ok(identifier) => identifier,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed token from Alchemy");
                    return None;
                }
            };

        let metadata = self
            .raw
            .and_then(|raw| {
                if let Some(error) = raw.error.as_deref() {
                    debug!(token = %identifier, error, "Alchemy reported a metadata error");
                }
                TokenMetadata::from_value(raw.metadata)
            })
            .unwrap_or_default();

        let descriptors = TokenDescriptors {
            name: non_blank(self.name).or_else(|| metadata.name().map(str::to_string)),
            description: non_blank(self.description)
                .or_else(|| metadata.description().map(str::to_string)),
        };

        let media = MediaUrls {
            image: metadata
                .get_str("image")
                .or_else(|| metadata.get_str("image_url"))
                .map(str::to_string)
                .or_else(|| self.image.and_then(|m| non_blank(m.original_url))),
            animation: metadata
                .get_str("animation_url")
                .map(str::to_string)
                .or_else(|| self.animation.and_then(|m| non_blank(m.original_url))),
        };

        Some(Token {
            identifier,
            owner: owner.cloned(),
            descriptors,
            metadata,
            media,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Clone)]
pub struct AlchemyProvider {
    client: reqwest::Client,
    chain: Chain,
    base_url: String,
}

impl AlchemyProvider {
    pub fn new(client: reqwest::Client, chain: Chain, base_url: impl Into<String>) -> Self {
        Self {
            client,
            chain,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    fn check_chain(&self, chain: Chain) -> Result<(), ProviderError> {
        if chain == self.chain {
            Ok(())
        } else {
            Err(ProviderError::Permanent(format!(
                "Alchemy provider for {} asked about {}",
                self.chain, chain
            )))
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            let lower = body.to_ascii_lowercase();
            if lower.contains("not found") || lower.contains("does not exist") {
                return Err(ProviderError::NotFound(format!("{method}: {body}")));
            }
            return Err(ProviderError::Permanent(format!("{method}: {body}")));
        }
        if !status.is_success() {
            return Err(status_error(status, method));
        }

        Ok(response.json::<T>().await?)
    }

    async fn owned_page(
        &self,
        owner: &Address,
        contract: Option<&Address>,
        page_key: Option<&str>,
    ) -> Result<(Vec<Token>, Option<String>), ProviderError> {
        let mut query = vec![
            ("owner", owner.to_string()),
            ("withMetadata", "true".to_string()),
            ("pageSize", PAGE_SIZE.to_string()),
        ];
        if let Some(contract) = contract {
            query.push(("contractAddresses[]", contract.to_string()));
        }
        if let Some(key) = page_key {
            query.push(("pageKey", key.to_string()));
        }

        let page: OwnedNftsResponse = self.get("getNFTsForOwner", &query).await?;
        let tokens = page
            .owned_nfts
            .into_iter()
            .filter_map(|nft| nft.into_token(self.chain, Some(owner)))
            .collect();
        Ok((tokens, page.page_key.filter(|k| !k.is_empty())))
    }

    async fn all_owned(
        &self,
        owner: &Address,
        contract: Option<&Address>,
    ) -> Result<Vec<Token>, ProviderError> {
        let mut tokens = Vec::new();
        let mut page_key: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let (page, next) = self.owned_page(owner, contract, page_key.as_deref()).await?;
            tokens.extend(page);
            match next {
                Some(key) => page_key = Some(key),
                None => return Ok(tokens),
            }
        }
        warn!(owner = %owner, "Owner listing truncated at page limit");
        Ok(tokens)
    }

    async fn fetch_nft(&self, token: &TokenIdentifier) -> Result<AlchemyNft, ProviderError> {
        self.check_chain(token.chain)?;
        self.get(
            "getNFTMetadata",
            &[
                ("contractAddress", token.contract.to_string()),
                ("tokenId", token.token_id.to_string()),
                ("refreshCache", "false".to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl TokensByOwner for AlchemyProvider {
    #[instrument(skip(self, cancel), fields(owner = %owner))]
    async fn tokens_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        self.check_chain(chain)?;
        cancellable(cancel, self.all_owned(owner, None)).await
    }
}

#[async_trait]
impl TokensIncrementalByOwner for AlchemyProvider {
    async fn tokens_incremental_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> TokenStream {
        if let Err(e) = self.check_chain(chain) {
            return TokenStream::failed(e);
        }

        let (tx, stream) = TokenStream::channel();
        let provider = self.clone();
        let owner = owner.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut page_key: Option<String> = None;
            for _ in 0..MAX_PAGES {
                let page = cancellable(&cancel, provider.owned_page(&owner, None, page_key.as_deref())).await;
                match page {
                    Ok((tokens, next)) => {
                        if !tokens.is_empty() && tx.pages.send(tokens).await.is_err() {
                            return;
                        }
                        match next {
                            Some(key) => page_key = Some(key),
                            None => return,
                        }
                    }
                    Err(e) => {
                        let _ = tx.errors.send(e).await;
                        return;
                    }
                }
            }
        });

        stream
    }
}

#[async_trait]
impl TokensByContract for AlchemyProvider {
    #[instrument(skip(self, cancel), fields(contract = %contract))]
    async fn tokens_by_contract(
        &self,
        chain: Chain,
        contract: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        self.check_chain(chain)?;
        cancellable(cancel, async {
            let mut tokens = Vec::new();
            let mut page_key: Option<String> = None;
            for _ in 0..MAX_PAGES {
                let mut query = vec![
                    ("contractAddress", contract.to_string()),
                    ("withMetadata", "true".to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                ];
                if let Some(key) = &page_key {
                    query.push(("pageKey", key.clone()));
                }
                let page: ContractNftsResponse = self.get("getNFTsForContract", &query).await?;
                tokens.extend(
                    page.nfts
                        .into_iter()
                        .filter_map(|nft| nft.into_token(self.chain, None)),
                );
                match page.page_key.filter(|k| !k.is_empty()) {
                    Some(key) => page_key = Some(key),
                    None => return Ok(tokens),
                }
            }
            warn!(contract = %contract, "Contract listing truncated at page limit");
            Ok(tokens)
        })
        .await
    }
}

#[async_trait]
impl TokensByContractAndOwner for AlchemyProvider {
    async fn tokens_by_contract_and_owner(
        &self,
        chain: Chain,
        contract: &Address,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        self.check_chain(chain)?;
        cancellable(cancel, self.all_owned(owner, Some(contract))).await
    }
}

#[async_trait]
impl TokenByIdentifiersAndOwner for AlchemyProvider {
    #[instrument(skip(self, cancel), fields(token = %token))]
    async fn token_by_identifiers_and_owner(
        &self,
        token: &TokenIdentifier,
        owner: Option<&Address>,
        cancel: &CancellationToken,
    ) -> Result<Token, ProviderError> {
        let nft = cancellable(cancel, self.fetch_nft(token)).await?;
        nft.into_token(self.chain, owner)
            .ok_or_else(|| ProviderError::Permanent(format!("malformed token {token}")))
    }
}

#[async_trait]
impl TokenMetadataByIdentifiers for AlchemyProvider {
    #[instrument(skip(self, cancel), fields(token = %token))]
    async fn token_metadata_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenMetadata, ProviderError> {
        let found = self.token_by_identifiers_and_owner(token, None, cancel).await?;
        Ok(found.metadata)
    }
}

#[async_trait]
impl TokenDescriptorsByIdentifiers for AlchemyProvider {
    async fn token_descriptors_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenDescriptors, ProviderError> {
        let found = self.token_by_identifiers_and_owner(token, None, cancel).await?;
        Ok(found.descriptors)
    }
}
