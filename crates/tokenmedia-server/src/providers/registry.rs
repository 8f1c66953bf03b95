//! Per-chain provider composition

use std::collections::BTreeMap;
use std::sync::Arc;
use tokenmedia_common::Chain;
use tracing::info;

use super::alchemy::AlchemyProvider;
use super::fallback::{EvalFallback, FailureFallback, TokenEval};
use super::indexer::IndexerProvider;
use super::{
    NameResolver, ProviderCapabilities, ProviderError, SignatureVerifier, Token,
    TokenByIdentifiersAndOwner, TokenDescriptorsByIdentifiers, TokenMetadataByIdentifiers,
    TokensByContract, TokensByContractAndOwner, TokensByOwner, TokensIncrementalByOwner,
};
use crate::config::ProvidersConfig;

fn either<T: ?Sized>(
    primary: &Option<Arc<T>>,
    secondary: &Option<Arc<T>>,
    both: impl FnOnce(Arc<T>, Arc<T>) -> Arc<T>,
) -> Option<Arc<T>> {
    match (primary.clone(), secondary.clone()) {
        (Some(p), Some(s)) => Some(both(p, s)),
        (p, s) => p.or(s),
    }
}

impl ProviderCapabilities {
    /// Slot-wise [`FailureFallback`]; a slot only one side fills is used as is
    pub fn with_failure_fallback(&self, secondary: &ProviderCapabilities) -> ProviderCapabilities {
        ProviderCapabilities {
            tokens_by_owner: either(
                &self.tokens_by_owner,
                &secondary.tokens_by_owner,
                |p, s| -> Arc<dyn TokensByOwner> { Arc::new(FailureFallback::new(p, s)) },
            ),
            tokens_incremental_by_owner: either(
                &self.tokens_incremental_by_owner,
                &secondary.tokens_incremental_by_owner,
                |p, s| -> Arc<dyn TokensIncrementalByOwner> { Arc::new(FailureFallback::new(p, s)) },
            ),
            tokens_by_contract: either(
                &self.tokens_by_contract,
                &secondary.tokens_by_contract,
                |p, s| -> Arc<dyn TokensByContract> { Arc::new(FailureFallback::new(p, s)) },
            ),
            tokens_by_contract_and_owner: either(
                &self.tokens_by_contract_and_owner,
                &secondary.tokens_by_contract_and_owner,
                |p, s| -> Arc<dyn TokensByContractAndOwner> { Arc::new(FailureFallback::new(p, s)) },
            ),
            token_by_identifiers_and_owner: either(
                &self.token_by_identifiers_and_owner,
                &secondary.token_by_identifiers_and_owner,
                |p, s| -> Arc<dyn TokenByIdentifiersAndOwner> {
                    Arc::new(FailureFallback::new(p, s))
                },
            ),
            token_metadata_by_identifiers: either(
                &self.token_metadata_by_identifiers,
                &secondary.token_metadata_by_identifiers,
                |p, s| -> Arc<dyn TokenMetadataByIdentifiers> {
                    Arc::new(FailureFallback::new(p, s))
                },
            ),
            token_descriptors_by_identifiers: either(
                &self.token_descriptors_by_identifiers,
                &secondary.token_descriptors_by_identifiers,
                |p, s| -> Arc<dyn TokenDescriptorsByIdentifiers> {
                    Arc::new(FailureFallback::new(p, s))
                },
            ),
            name_resolver: either(
                &self.name_resolver,
                &secondary.name_resolver,
                |p, s| -> Arc<dyn NameResolver> { Arc::new(FailureFallback::new(p, s)) },
            ),
            signature_verifier: either(
                &self.signature_verifier,
                &secondary.signature_verifier,
                |p, s| -> Arc<dyn SignatureVerifier> { Arc::new(FailureFallback::new(p, s)) },
            ),
        }
    }

    /// Wrap the listing slots in [`EvalFallback`]
    pub fn with_eval_fallback(
        &self,
        secondary: Arc<dyn TokenByIdentifiersAndOwner>,
        eval: TokenEval,
    ) -> ProviderCapabilities {
        let mut wrapped = self.clone();
        wrapped.tokens_by_owner = self.tokens_by_owner.clone().map(|p| -> Arc<dyn TokensByOwner> {
            Arc::new(EvalFallback::new(p, secondary.clone(), eval.clone()))
        });
        wrapped.tokens_incremental_by_owner = self.tokens_incremental_by_owner.clone().map(
            |p| -> Arc<dyn TokensIncrementalByOwner> {
                Arc::new(EvalFallback::new(p, secondary.clone(), eval.clone()))
            },
        );
        wrapped.tokens_by_contract =
            self.tokens_by_contract.clone().map(|p| -> Arc<dyn TokensByContract> {
                Arc::new(EvalFallback::new(p, secondary.clone(), eval.clone()))
            });
        wrapped.tokens_by_contract_and_owner = self.tokens_by_contract_and_owner.clone().map(
            |p| -> Arc<dyn TokensByContractAndOwner> {
                Arc::new(EvalFallback::new(p, secondary.clone(), eval.clone()))
            },
        );
        wrapped
    }
}

/// Tokens whose metadata came back empty get a second opinion
pub fn has_metadata() -> TokenEval {
    Arc::new(|token: &Token| token.has_metadata())
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    chains: BTreeMap<Chain, ProviderCapabilities>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alchemy for every chain with an API URL, the indexer everywhere it is
    /// configured.
    ///
    /// Metadata lookups ask the indexer first and fall back to Alchemy.
    /// Listings come from Alchemy with empty-metadata tokens patched from the
    /// indexer.
    pub fn from_config(client: reqwest::Client, config: &ProvidersConfig) -> Self {
        let indexer = config
            .indexer_host
            .as_deref()
            .map(|host| Arc::new(IndexerProvider::new(client.clone(), host)));

        let mut registry = Self::new();
        for chain in Chain::ALL {
            let alchemy = config
                .alchemy_urls
                .get(&chain)
                .map(|url| Arc::new(AlchemyProvider::new(client.clone(), chain, url.as_str())));

            let capabilities = match (alchemy, indexer.clone()) {
                (Some(alchemy), Some(indexer)) => {
                    let lookup: Arc<dyn TokenByIdentifiersAndOwner> = indexer.clone();
                    indexer_capabilities(indexer)
                        .with_failure_fallback(&ProviderCapabilities::full(alchemy))
                        .with_eval_fallback(lookup, has_metadata())
                }
                (Some(alchemy), None) => ProviderCapabilities::full(alchemy),
                (None, Some(indexer)) => indexer_capabilities(indexer),
                (None, None) => continue,
            };
            registry.insert(chain, capabilities);
        }

        info!(chains = ?registry.chains.keys().collect::<Vec<_>>(), "Provider registry ready");
        registry
    }

    pub fn insert(&mut self, chain: Chain, capabilities: ProviderCapabilities) {
        self.chains.insert(chain, capabilities);
    }

    pub fn for_chain(&self, chain: Chain) -> Result<&ProviderCapabilities, ProviderError> {
        self.chains
            .get(&chain)
            .ok_or(ProviderError::Unsupported("no provider configured for chain"))
    }
}

fn indexer_capabilities(indexer: Arc<IndexerProvider>) -> ProviderCapabilities {
    ProviderCapabilities {
        token_by_identifiers_and_owner: Some(indexer.clone()),
        token_metadata_by_identifiers: Some(indexer.clone()),
        token_descriptors_by_identifiers: Some(indexer.clone()),
        name_resolver: Some(indexer.clone()),
        signature_verifier: Some(indexer),
        ..ProviderCapabilities::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_composition() {
        let mut config = ProvidersConfig::default();
        config
            .alchemy_urls
            .insert(Chain::Ethereum, "https://eth.example/nft/v3/key".to_string());
        config.indexer_host = Some("https://indexer.example".to_string());

        let registry = ProviderRegistry::from_config(reqwest::Client::new(), &config);

        let eth = registry.for_chain(Chain::Ethereum).ok().map(|c| {
            (
                c.tokens_by_owner.is_some(),
                c.tokens_incremental_by_owner.is_some(),
                c.token_metadata_by_identifiers.is_some(),
                c.name_resolver.is_some(),
            )
        });
        assert_eq!(eth, Some((true, true, true, true)));

        let base = registry.for_chain(Chain::Base).ok().map(|c| {
            (c.tokens_by_owner.is_some(), c.token_metadata_by_identifiers.is_some())
        });
        assert_eq!(base, Some((false, true)));
    }

    #[test]
    fn test_unconfigured_chain_is_unsupported() {
        let registry = ProviderRegistry::from_config(reqwest::Client::new(), &ProvidersConfig::default());
        assert!(matches!(
            registry.for_chain(Chain::Polygon),
            Err(ProviderError::Unsupported(_))
        ));
    }
}
