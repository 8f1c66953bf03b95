//! Provider combinators
//!
//! [`FailureFallback`] answers from the primary and falls back to the
//! secondary on error. [`EvalFallback`] answers from the primary and patches
//! individual tokens the primary answered poorly, using the secondary's
//! single-token lookup.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    NameResolver, ProviderError, SignatureVerifier, Token, TokenByIdentifiersAndOwner,
    TokenDescriptors, TokenDescriptorsByIdentifiers, TokenMetadataByIdentifiers, TokenStream,
    TokensByContract, TokensByContractAndOwner, TokensByOwner, TokensIncrementalByOwner,
};

/// Concurrent replacement lookups per batch
pub const EVAL_FANOUT: usize = 16;

/// Whether a primary answer is good enough to keep as is
pub type TokenEval = Arc<dyn Fn(&Token) -> bool + Send + Sync>;

/// Primary first; any error hands the call to the secondary
pub struct FailureFallback<T: ?Sized> {
    primary: Arc<T>,
    secondary: Arc<T>,
}

impl<T: ?Sized> FailureFallback<T> {
    pub fn new(primary: Arc<T>, secondary: Arc<T>) -> Self {
        Self { primary, secondary }
    }
}

async fn with_fallback<R, P, S, SF>(
    capability: &'static str,
    primary: P,
    secondary: S,
) -> Result<R, ProviderError>
where
    P: Future<Output = Result<R, ProviderError>>,
    S: FnOnce() -> SF,
    SF: Future<Output = Result<R, ProviderError>>,
{
    match primary.await {
        Ok(result) => Ok(result),
        Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
        Err(e) => {
            warn!(capability, error = %e, "Primary provider failed, trying fallback");
            secondary().await
        }
    }
}

#[async_trait]
impl TokensByOwner for FailureFallback<dyn TokensByOwner> {
    async fn tokens_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        with_fallback(
            "TokensByOwner",
            self.primary.tokens_by_owner(chain, owner, cancel),
            || self.secondary.tokens_by_owner(chain, owner, cancel),
        )
        .await
    }
}

#[async_trait]
impl TokensByContract for FailureFallback<dyn TokensByContract> {
    async fn tokens_by_contract(
        &self,
        chain: Chain,
        contract: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        with_fallback(
            "TokensByContract",
            self.primary.tokens_by_contract(chain, contract, cancel),
            || self.secondary.tokens_by_contract(chain, contract, cancel),
        )
        .await
    }
}

#[async_trait]
impl TokensByContractAndOwner for FailureFallback<dyn TokensByContractAndOwner> {
    async fn tokens_by_contract_and_owner(
        &self,
        chain: Chain,
        contract: &Address,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        with_fallback(
            "TokensByContractAndOwner",
            self.primary
                .tokens_by_contract_and_owner(chain, contract, owner, cancel),
            || {
                self.secondary
                    .tokens_by_contract_and_owner(chain, contract, owner, cancel)
            },
        )
        .await
    }
}

#[async_trait]
impl TokenByIdentifiersAndOwner for FailureFallback<dyn TokenByIdentifiersAndOwner> {
    async fn token_by_identifiers_and_owner(
        &self,
        token: &TokenIdentifier,
        owner: Option<&Address>,
        cancel: &CancellationToken,
    ) -> Result<Token, ProviderError> {
        with_fallback(
            "TokenByIdentifiersAndOwner",
            self.primary.token_by_identifiers_and_owner(token, owner, cancel),
            || self.secondary.token_by_identifiers_and_owner(token, owner, cancel),
        )
        .await
    }
}

#[async_trait]
impl TokenMetadataByIdentifiers for FailureFallback<dyn TokenMetadataByIdentifiers> {
    async fn token_metadata_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenMetadata, ProviderError> {
        with_fallback(
            "TokenMetadataByIdentifiers",
            self.primary.token_metadata_by_identifiers(token, cancel),
            || self.secondary.token_metadata_by_identifiers(token, cancel),
        )
        .await
    }
}

#[async_trait]
impl TokenDescriptorsByIdentifiers for FailureFallback<dyn TokenDescriptorsByIdentifiers> {
    async fn token_descriptors_by_identifiers(
        &self,
        token: &TokenIdentifier,
        cancel: &CancellationToken,
    ) -> Result<TokenDescriptors, ProviderError> {
        with_fallback(
            "TokenDescriptorsByIdentifiers",
            self.primary.token_descriptors_by_identifiers(token, cancel),
            || self.secondary.token_descriptors_by_identifiers(token, cancel),
        )
        .await
    }
}

#[async_trait]
impl NameResolver for FailureFallback<dyn NameResolver> {
    async fn resolve_name(
        &self,
        chain: Chain,
        address: &Address,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        with_fallback(
            "NameResolver",
            self.primary.resolve_name(chain, address, cancel),
            || self.secondary.resolve_name(chain, address, cancel),
        )
        .await
    }
}

#[async_trait]
impl SignatureVerifier for FailureFallback<dyn SignatureVerifier> {
    async fn verify_signature(
        &self,
        chain: Chain,
        address: &Address,
        message: &str,
        signature: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ProviderError> {
        with_fallback(
            "SignatureVerifier",
            self.primary
                .verify_signature(chain, address, message, signature, cancel),
            || {
                self.secondary
                    .verify_signature(chain, address, message, signature, cancel)
            },
        )
        .await
    }
}

/// On the first primary error the stream switches to the secondary for good.
/// Tokens the consumer already received from the primary are not sent again.
#[async_trait]
impl TokensIncrementalByOwner for FailureFallback<dyn TokensIncrementalByOwner> {
    async fn tokens_incremental_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> TokenStream {
        let mut primary = self
            .primary
            .tokens_incremental_by_owner(chain, owner, cancel)
            .await;
        let secondary = self.secondary.clone();
        let owner = owner.clone();
        let cancel = cancel.clone();
        let (tx, out) = TokenStream::channel();

        tokio::spawn(async move {
            let mut emitted: HashSet<TokenIdentifier> = HashSet::new();

            loop {
                match primary.next().await {
                    None => return,
                    Some(Ok(page)) => {
                        emitted.extend(page.iter().map(|t| t.identifier.clone()));
                        if tx.pages.send(page).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(ProviderError::Cancelled)) => {
                        let _ = tx.errors.send(ProviderError::Cancelled).await;
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(
                            capability = "TokensIncrementalByOwner",
                            error = %e,
                            emitted = emitted.len(),
                            "Primary stream failed, switching to fallback"
                        );
                        break;
                    }
                }
            }
            drop(primary);

            let mut secondary = secondary
                .tokens_incremental_by_owner(chain, &owner, &cancel)
                .await;
            while let Some(item) = secondary.next().await {
                match item {
                    Ok(page) => {
                        let fresh: Vec<Token> = page
                            .into_iter()
                            .filter(|t| !emitted.contains(&t.identifier))
                            .collect();
                        if fresh.is_empty() {
                            continue;
                        }
                        if tx.pages.send(fresh).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.errors.send(e).await;
                        return;
                    }
                }
            }
        });

        out
    }
}

/// Primary answers, with poor tokens patched field by field from the
/// secondary's single-token lookup
pub struct EvalFallback<T: ?Sized> {
    primary: Arc<T>,
    secondary: Arc<dyn TokenByIdentifiersAndOwner>,
    eval: TokenEval,
}

impl<T: ?Sized> EvalFallback<T> {
    pub fn new(
        primary: Arc<T>,
        secondary: Arc<dyn TokenByIdentifiersAndOwner>,
        eval: TokenEval,
    ) -> Self {
        Self {
            primary,
            secondary,
            eval,
        }
    }

    async fn resolve_tokens(
        &self,
        tokens: Vec<Token>,
        owner: Option<&Address>,
        cancel: &CancellationToken,
    ) -> Vec<Token> {
        resolve_tokens(&self.secondary, &self.eval, tokens, owner, cancel).await
    }
}

async fn resolve_tokens(
    secondary: &Arc<dyn TokenByIdentifiersAndOwner>,
    eval: &TokenEval,
    tokens: Vec<Token>,
    owner: Option<&Address>,
    cancel: &CancellationToken,
) -> Vec<Token> {
    stream::iter(tokens)
        .map(|token| async move {
            if eval(&token) {
                return token;
            }
            let lookup_owner = token.owner.as_ref().or(owner);
            match secondary
                .token_by_identifiers_and_owner(&token.identifier, lookup_owner, cancel)
                .await
            {
                Ok(replacement) => substitute(token, replacement),
                Err(e) => {
                    debug!(token = %token.identifier, error = %e, "No replacement for token");
                    token
                }
            }
        })
        .buffered(EVAL_FANOUT)
        .collect()
        .await
}

/// Copy the allow-listed fields the replacement actually carries
fn substitute(mut token: Token, replacement: Token) -> Token {
    if replacement.has_metadata() {
        token.metadata = replacement.metadata;
    }
    if replacement.descriptors.name.is_some() {
        token.descriptors.name = replacement.descriptors.name;
    }
    if replacement.descriptors.description.is_some() {
        token.descriptors.description = replacement.descriptors.description;
    }
    if replacement.media.image.is_some() {
        token.media.image = replacement.media.image;
    }
    if replacement.media.animation.is_some() {
        token.media.animation = replacement.media.animation;
    }
    token
}

#[async_trait]
impl TokensByOwner for EvalFallback<dyn TokensByOwner> {
    async fn tokens_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        let tokens = self.primary.tokens_by_owner(chain, owner, cancel).await?;
        Ok(self.resolve_tokens(tokens, Some(owner), cancel).await)
    }
}

#[async_trait]
impl TokensByContract for EvalFallback<dyn TokensByContract> {
    async fn tokens_by_contract(
        &self,
        chain: Chain,
        contract: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        let tokens = self
            .primary
            .tokens_by_contract(chain, contract, cancel)
            .await?;
        Ok(self.resolve_tokens(tokens, None, cancel).await)
    }
}

#[async_trait]
impl TokensByContractAndOwner for EvalFallback<dyn TokensByContractAndOwner> {
    async fn tokens_by_contract_and_owner(
        &self,
        chain: Chain,
        contract: &Address,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, ProviderError> {
        let tokens = self
            .primary
            .tokens_by_contract_and_owner(chain, contract, owner, cancel)
            .await?;
        Ok(self.resolve_tokens(tokens, Some(owner), cancel).await)
    }
}

#[async_trait]
impl TokenByIdentifiersAndOwner for EvalFallback<dyn TokenByIdentifiersAndOwner> {
    async fn token_by_identifiers_and_owner(
        &self,
        token: &TokenIdentifier,
        owner: Option<&Address>,
        cancel: &CancellationToken,
    ) -> Result<Token, ProviderError> {
        let found = self
            .primary
            .token_by_identifiers_and_owner(token, owner, cancel)
            .await?;
        let mut resolved = self.resolve_tokens(vec![found.clone()], owner, cancel).await;
        Ok(resolved.pop().unwrap_or(found))
    }
}

#[async_trait]
impl TokensIncrementalByOwner for EvalFallback<dyn TokensIncrementalByOwner> {
    async fn tokens_incremental_by_owner(
        &self,
        chain: Chain,
        owner: &Address,
        cancel: &CancellationToken,
    ) -> TokenStream {
        let mut primary = self
            .primary
            .tokens_incremental_by_owner(chain, owner, cancel)
            .await;
        let secondary = self.secondary.clone();
        let eval = self.eval.clone();
        let owner = owner.clone();
        let cancel = cancel.clone();
        let (tx, out) = TokenStream::channel();

        tokio::spawn(async move {
            while let Some(item) = primary.next().await {
                match item {
                    Ok(page) => {
                        let page = resolve_tokens(&secondary, &eval, page, Some(&owner), &cancel).await;
                        if tx.pages.send(page).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.errors.send(e).await;
                        return;
                    }
                }
            }
        });

        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn id(n: u32) -> TokenIdentifier {
        TokenIdentifier::parse(
            Chain::Ethereum,
            "0x00000000000000000000000000000000000000aa",
            &n.to_string(),
        )
        .unwrap()
    }

    fn owner() -> Address {
        Address::parse("0x00000000000000000000000000000000000000bb").unwrap()
    }

    fn named(n: u32, name: &str) -> Token {
        let mut token = Token::new(id(n));
        token.descriptors.name = Some(name.to_string());
        token
    }

    struct Fixed {
        result: Result<Vec<Token>, ProviderError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(result: Result<Vec<Token>, ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TokensByOwner for Fixed {
        async fn tokens_by_owner(
            &self,
            _chain: Chain,
            _owner: &Address,
            _cancel: &CancellationToken,
        ) -> Result<Vec<Token>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn test_failure_fallback_uses_secondary_on_error() {
        let primary = Fixed::new(Err(ProviderError::Transient("down".into())));
        let secondary = Fixed::new(Ok(vec![named(1, "from secondary")]));
        let combined = FailureFallback::<dyn TokensByOwner>::new(primary.clone(), secondary.clone());

        let tokens = combined
            .tokens_by_owner(Chain::Ethereum, &owner(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tokens[0].descriptors.name.as_deref(), Some("from secondary"));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_fallback_keeps_empty_success() {
        let primary = Fixed::new(Ok(vec![]));
        let secondary = Fixed::new(Ok(vec![named(1, "unused")]));
        let combined = FailureFallback::<dyn TokensByOwner>::new(primary, secondary.clone());

        let tokens = combined
            .tokens_by_owner(Chain::Ethereum, &owner(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(tokens.is_empty());
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    struct Pages {
        pages: Vec<Vec<Token>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl TokensIncrementalByOwner for Pages {
        async fn tokens_incremental_by_owner(
            &self,
            _chain: Chain,
            _owner: &Address,
            _cancel: &CancellationToken,
        ) -> TokenStream {
            let (tx, stream) = TokenStream::channel();
            let pages = self.pages.clone();
            let fail_after = self.fail_after;
            tokio::spawn(async move {
                for (i, page) in pages.into_iter().enumerate() {
                    if fail_after == Some(i) {
                        // Let the consumer take every page sent so far.
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let _ = tx.errors.send(ProviderError::Transient("boom".into())).await;
                        return;
                    }
                    let _ = tx.pages.send(page).await;
                }
            });
            stream
        }
    }

    #[tokio::test]
    async fn test_streaming_switches_once_without_reemitting() {
        let primary = Arc::new(Pages {
            pages: vec![vec![named(1, "p")], vec![named(2, "p")]],
            fail_after: Some(1),
        });
        let secondary = Arc::new(Pages {
            pages: vec![vec![named(1, "s"), named(2, "s")], vec![named(3, "s")]],
            fail_after: None,
        });
        let combined =
            FailureFallback::<dyn TokensIncrementalByOwner>::new(primary, secondary);

        let tokens = combined
            .tokens_incremental_by_owner(Chain::Ethereum, &owner(), &CancellationToken::new())
            .await
            .collect()
            .await
            .unwrap();

        let seen: Vec<(String, String)> = tokens
            .iter()
            .map(|t| {
                (
                    t.identifier.token_id.to_string(),
                    t.descriptors.name.clone().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                ("0x1".to_string(), "p".to_string()),
                ("0x2".to_string(), "s".to_string()),
                ("0x3".to_string(), "s".to_string()),
            ]
        );
    }

    struct Replacements {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<TokenIdentifier>>,
    }

    #[async_trait]
    impl TokenByIdentifiersAndOwner for Replacements {
        async fn token_by_identifiers_and_owner(
            &self,
            token: &TokenIdentifier,
            _owner: Option<&Address>,
            _cancel: &CancellationToken,
        ) -> Result<Token, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(token.clone());

            let mut replacement = Token::new(token.clone());
            replacement.metadata =
                TokenMetadata::from_json(r#"{"name":"patched","image":"https://x/p.png"}"#).unwrap();
            replacement.media.image = Some("https://x/p.png".into());
            Ok(replacement)
        }
    }

    #[tokio::test]
    async fn test_eval_fallback_patches_fields_with_bounded_fanout() {
        let mut tokens: Vec<Token> = (0..40).map(|n| named(n, "kept")).collect();
        tokens[0].metadata = TokenMetadata::from_json(r#"{"name":"good"}"#).unwrap();

        let primary = Fixed::new(Ok(tokens));
        let secondary = Arc::new(Replacements {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let eval: TokenEval = Arc::new(|t: &Token| t.has_metadata());
        let combined = EvalFallback::<dyn TokensByOwner>::new(primary, secondary.clone(), eval);

        let result = combined
            .tokens_by_owner(Chain::Ethereum, &owner(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.len(), 40);
        assert_eq!(result[0].metadata.name(), Some("good"));
        assert!(result[0].media.image.is_none());

        assert_eq!(result[1].identifier, id(1));
        assert_eq!(result[1].metadata.name(), Some("patched"));
        assert_eq!(result[1].descriptors.name.as_deref(), Some("kept"));
        assert_eq!(result[1].media.image.as_deref(), Some("https://x/p.png"));

        assert_eq!(secondary.seen.lock().unwrap().len(), 39);
        assert!(secondary.peak.load(Ordering::SeqCst) <= EVAL_FANOUT);
    }
}
