//! In-process repository for tests and local runs without Postgres

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use uuid::Uuid;

use super::models::{address_columns, identifier_columns};
use super::{
    JobRunRecord, OwnedToken, PipelineResults, RepositoryError, RepositoryResult, Split,
    TokenDefinition, TokenMediaRow, TokenRepository,
};

#[derive(Debug, Default)]
struct State {
    medias: Vec<TokenMediaRow>,
    jobs: Vec<JobRunRecord>,
    definitions: Vec<TokenDefinition>,
    splits: Vec<Split>,
    tokens: Vec<OwnedToken>,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every following insert fail as if the database were down
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert_split(&self, split: Split) {
        self.state().splits.push(split);
    }

    pub fn insert_owned_token(&self, token: OwnedToken) {
        self.state().tokens.push(token);
    }

    pub fn owned_tokens(&self) -> Vec<OwnedToken> {
        self.state().tokens.clone()
    }

    pub fn job_runs(&self) -> Vec<JobRunRecord> {
        self.state().jobs.clone()
    }

    pub fn media_rows(&self) -> Vec<TokenMediaRow> {
        self.state().medias.clone()
    }
}

fn same_token(chain: &str, contract: &str, token_id: &str, token: &TokenIdentifier) -> bool {
    (chain, contract, token_id) == identifier_columns(token)
}

#[async_trait]
impl TokenRepository for MemoryRepository {
    async fn insert_token_pipeline_results(
        &self,
        results: PipelineResults,
    ) -> RepositoryResult<Option<TokenMediaRow>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("writes disabled".into()));
        }

        let (chain, contract, token_id) = identifier_columns(&results.token);
        let now = Utc::now();
        let mut state = self.state();

        let media_row = results.media.map(|media| TokenMediaRow {
            id: Uuid::new_v4(),
            chain: chain.to_string(),
            contract: contract.to_string(),
            token_id: token_id.to_string(),
            active: true,
            media: Json(media),
            processing_job_id: results.run_id,
            created_at: now,
        });

        if let Some(row) = &media_row {
            for existing in state.medias.iter_mut().filter(|m| {
                same_token(&m.chain, &m.contract, &m.token_id, &results.token)
            }) {
                existing.active = false;
            }
            state.medias.push(row.clone());
        }

        let media_id = media_row.as_ref().map(|row| row.id);
        let metadata = results.metadata.into_value();

        state.jobs.push(JobRunRecord {
            id: results.run_id,
            chain: chain.to_string(),
            contract: contract.to_string(),
            token_id: token_id.to_string(),
            cause: results.cause,
            metadata: Json(metadata.clone()),
            name: results.name.clone(),
            description: results.description.clone(),
            properties: Json(results.properties),
            pipeline_metadata: Json(results.pipeline_metadata),
            media_id,
            processor_version: results.processor_version,
            error_kind: results.error_kind,
            created_at: now,
        });

        let has_metadata = metadata.as_object().is_some_and(|m| !m.is_empty());
        if has_metadata {
            let existing = state.definitions.iter().position(|d| {
                same_token(&d.chain, &d.contract, &d.token_id, &results.token)
            });
            match existing {
                Some(index) => {
                    let definition = &mut state.definitions[index];
                    definition.name = results.name;
                    definition.description = results.description;
                    definition.metadata = Json(metadata);
                    definition.media_id = media_id.or(definition.media_id);
                    definition.updated_at = now;
                }
                None => state.definitions.push(TokenDefinition {
                    id: Uuid::new_v4(),
                    chain: chain.to_string(),
                    contract: contract.to_string(),
                    token_id: token_id.to_string(),
                    name: results.name,
                    description: results.description,
                    metadata: Json(metadata),
                    media_id,
                    updated_at: now,
                }),
            }
        }

        Ok(media_row)
    }

    async fn get_split_by_address(
        &self,
        chain: Chain,
        address: &Address,
    ) -> RepositoryResult<Option<Split>> {
        let (chain, address) = address_columns(chain, address);
        Ok(self
            .state()
            .splits
            .iter()
            .find(|s| s.chain == chain && s.address == address && !s.deleted)
            .cloned())
    }

    async fn remove_wallet_from_tokens(
        &self,
        wallet_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<u64> {
        let mut touched = 0;
        for token in self
            .state()
            .tokens
            .iter_mut()
            .filter(|t| t.owner_user_id == user_id && t.owned_by_wallets.contains(&wallet_id))
        {
            token.owned_by_wallets.retain(|w| *w != wallet_id);
            touched += 1;
        }
        Ok(touched)
    }

    async fn get_token_metadata(
        &self,
        chain: Chain,
        contract: &Address,
    ) -> RepositoryResult<Option<TokenMetadata>> {
        let (chain, contract) = address_columns(chain, contract);
        Ok(self
            .state()
            .definitions
            .iter()
            .filter(|d| d.chain == chain && d.contract == contract)
            .max_by_key(|d| d.updated_at)
            .and_then(|d| TokenMetadata::from_value(d.metadata.0.clone()))
            .filter(|m| !m.is_empty()))
    }

    async fn get_token_definition(
        &self,
        token: &TokenIdentifier,
    ) -> RepositoryResult<Option<TokenDefinition>> {
        Ok(self
            .state()
            .definitions
            .iter()
            .find(|d| same_token(&d.chain, &d.contract, &d.token_id, token))
            .cloned())
    }

    async fn get_token_media(
        &self,
        token: &TokenIdentifier,
    ) -> RepositoryResult<Option<TokenMediaRow>> {
        Ok(self
            .state()
            .medias
            .iter()
            .rev()
            .find(|m| m.active && same_token(&m.chain, &m.contract, &m.token_id, token))
            .cloned())
    }

    async fn get_job_run(&self, run_id: Uuid) -> RepositoryResult<Option<JobRunRecord>> {
        Ok(self.state().jobs.iter().find(|j| j.id == run_id).cloned())
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::{TokenMedia, TokenProperties};
    use crate::pipeline::metadata::PipelineMetadata;
    use tokenmedia_common::MediaType;

    fn token() -> TokenIdentifier {
        TokenIdentifier::parse(Chain::Ethereum, "0x00000000000000000000000000000000000000aa", "7")
            .unwrap()
    }

    fn results(media: Option<TokenMedia>) -> PipelineResults {
        let metadata = TokenMetadata::from_json(r#"{"name":"A","traits":[1,2]}"#).unwrap();
        PipelineResults {
            run_id: Uuid::new_v4(),
            token: token(),
            cause: "refresh".into(),
            properties: TokenProperties::derive(&metadata, media.as_ref()),
            name: Some("A".into()),
            description: None,
            metadata,
            pipeline_metadata: PipelineMetadata::new(),
            media,
            processor_version: "test".into(),
            error_kind: None,
        }
    }

    #[tokio::test]
    async fn test_new_media_deactivates_previous() {
        let repo = MemoryRepository::new();
        let media = TokenMedia {
            media_type: MediaType::Image,
            ..TokenMedia::default()
        };
        let first = repo
            .insert_token_pipeline_results(results(Some(media.clone())))
            .await
            .unwrap()
            .unwrap();
        let second = repo
            .insert_token_pipeline_results(results(Some(media)))
            .await
            .unwrap()
            .unwrap();

        let active = repo.get_token_media(&token()).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(active.id, first.id);
        assert_eq!(repo.media_rows().iter().filter(|m| m.active).count(), 1);
        assert_eq!(repo.job_runs().len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_round_trips() {
        let repo = MemoryRepository::new();
        let input = results(None);
        let run_id = input.run_id;
        let expected = input.metadata.clone();
        assert!(repo.insert_token_pipeline_results(input).await.unwrap().is_none());

        let record = repo.get_job_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.token_metadata(), expected);
        assert!(record.media_id.is_none());

        let shared = repo
            .get_token_metadata(Chain::Ethereum, &token().contract)
            .await
            .unwrap();
        assert_eq!(shared, Some(expected));
    }

    #[tokio::test]
    async fn test_remove_wallet_from_tokens() {
        let repo = MemoryRepository::new();
        let user = Uuid::new_v4();
        let wallet = Uuid::new_v4();
        let other_wallet = Uuid::new_v4();
        for wallets in [vec![wallet, other_wallet], vec![other_wallet]] {
            repo.insert_owned_token(OwnedToken {
                id: Uuid::new_v4(),
                chain: "ethereum".into(),
                contract: token().contract.to_string(),
                token_id: "0x1".into(),
                owner_user_id: user,
                owned_by_wallets: wallets,
            });
        }

        assert_eq!(repo.remove_wallet_from_tokens(wallet, user).await.unwrap(), 1);
        assert!(repo
            .owned_tokens()
            .iter()
            .all(|t| !t.owned_by_wallets.contains(&wallet)));
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let repo = MemoryRepository::new();
        repo.fail_writes(true);
        assert!(matches!(
            repo.insert_token_pipeline_results(results(None)).await,
            Err(RepositoryError::Unavailable(_))
        ));
    }
}
