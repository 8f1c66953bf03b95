//! Postgres implementation of [`TokenRepository`]

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::PgPool;
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::models::{address_columns, identifier_columns};
use super::{
    JobRunRecord, PipelineResults, RepositoryResult, Split, TokenDefinition, TokenMediaRow,
    TokenRepository,
};

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TokenRepository for PgRepository {
    #[instrument(skip(self, results), fields(run_id = %results.run_id, token = %results.token))]
    async fn insert_token_pipeline_results(
        &self,
        results: PipelineResults,
    ) -> RepositoryResult<Option<TokenMediaRow>> {
        let (chain, contract, token_id) = identifier_columns(&results.token);
        let media_id = Uuid::new_v4();
        let has_media = results.media.is_some();
        let media = Json(results.media.unwrap_or_default());
        let metadata = Json(results.metadata.into_value());

        let row = sqlx::query_as::<_, TokenMediaRow>(
            r#"
            WITH deactivated AS (
                UPDATE token_medias
                SET active = false
                WHERE $7 AND chain = $2 AND contract = $3 AND token_id = $4 AND active
                RETURNING id
            ),
            new_media AS (
                INSERT INTO token_medias
                    (id, chain, contract, token_id, active, media, processing_job_id, created_at)
                SELECT $1, $2, $3, $4, true, $5, $6, now()
                WHERE $7
                RETURNING id, chain, contract, token_id, active, media, processing_job_id, created_at
            ),
            job AS (
                INSERT INTO token_processing_jobs
                    (id, chain, contract, token_id, cause, metadata, name, description,
                     properties, pipeline_metadata, media_id, processor_version, error_kind,
                     created_at)
                VALUES
                    ($6, $2, $3, $4, $8, $9, $10, $11, $12, $13,
                     CASE WHEN $7 THEN $1 ELSE NULL END, $14, $15, now())
                RETURNING id
            ),
            definition AS (
                INSERT INTO token_definitions
                    (id, chain, contract, token_id, name, description, metadata, media_id, updated_at)
                SELECT gen_random_uuid(), $2, $3, $4, $10, $11, $9,
                       CASE WHEN $7 THEN $1 ELSE NULL END, now()
                WHERE $9 <> '{}'::jsonb
                ON CONFLICT (chain, contract, token_id) DO UPDATE
                    SET name = EXCLUDED.name,
                        description = EXCLUDED.description,
                        metadata = EXCLUDED.metadata,
                        media_id = COALESCE(EXCLUDED.media_id, token_definitions.media_id),
                        updated_at = EXCLUDED.updated_at
                RETURNING id
            )
            SELECT id, chain, contract, token_id, active, media, processing_job_id, created_at
            FROM new_media
            "#,
        )
        .bind(media_id)
        .bind(chain)
        .bind(contract)
        .bind(token_id)
        .bind(media)
        .bind(results.run_id)
        .bind(has_media)
        .bind(&results.cause)
        .bind(metadata)
        .bind(&results.name)
        .bind(&results.description)
        .bind(Json(results.properties))
        .bind(Json(&results.pipeline_metadata))
        .bind(&results.processor_version)
        .bind(&results.error_kind)
        .fetch_optional(&self.pool)
        .await?;

        debug!(media = row.is_some(), "Pipeline results persisted");
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_split_by_address(
        &self,
        chain: Chain,
        address: &Address,
    ) -> RepositoryResult<Option<Split>> {
        let (chain, address) = address_columns(chain, address);
        let split = sqlx::query_as::<_, Split>(
            r#"
            SELECT id, chain, address, name, owner_user_id, owner_wallet_id, recipients,
                   deleted, created_at
            FROM splits
            WHERE chain = $1 AND address = $2 AND NOT deleted
            "#,
        )
        .bind(chain)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(split)
    }

    #[instrument(skip(self))]
    async fn remove_wallet_from_tokens(
        &self,
        wallet_id: Uuid,
        user_id: Uuid,
    ) -> RepositoryResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tokens
            SET owned_by_wallets = array_remove(owned_by_wallets, $1),
                updated_at = now()
            WHERE owner_user_id = $2 AND $1 = ANY(owned_by_wallets)
            "#,
        )
        .bind(wallet_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn get_token_metadata(
        &self,
        chain: Chain,
        contract: &Address,
    ) -> RepositoryResult<Option<TokenMetadata>> {
        let (chain, contract) = address_columns(chain, contract);
        let metadata: Option<(Json<JsonValue>,)> = sqlx::query_as(
            r#"
            SELECT metadata
            FROM token_definitions
            WHERE chain = $1 AND contract = $2 AND metadata <> '{}'::jsonb
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(chain)
        .bind(contract)
        .fetch_optional(&self.pool)
        .await?;

        Ok(metadata.and_then(|(Json(value),)| TokenMetadata::from_value(value)))
    }

    async fn get_token_definition(
        &self,
        token: &TokenIdentifier,
    ) -> RepositoryResult<Option<TokenDefinition>> {
        let (chain, contract, token_id) = identifier_columns(token);
        let definition = sqlx::query_as::<_, TokenDefinition>(
            r#"
            SELECT id, chain, contract, token_id, name, description, metadata, media_id, updated_at
            FROM token_definitions
            WHERE chain = $1 AND contract = $2 AND token_id = $3
            "#,
        )
        .bind(chain)
        .bind(contract)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(definition)
    }

    async fn get_token_media(
        &self,
        token: &TokenIdentifier,
    ) -> RepositoryResult<Option<TokenMediaRow>> {
        let (chain, contract, token_id) = identifier_columns(token);
        let media = sqlx::query_as::<_, TokenMediaRow>(
            r#"
            SELECT id, chain, contract, token_id, active, media, processing_job_id, created_at
            FROM token_medias
            WHERE chain = $1 AND contract = $2 AND token_id = $3 AND active
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(chain)
        .bind(contract)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(media)
    }

    async fn get_job_run(&self, run_id: Uuid) -> RepositoryResult<Option<JobRunRecord>> {
        let record = sqlx::query_as::<_, JobRunRecord>(
            r#"
            SELECT id, chain, contract, token_id, cause, metadata, name, description, properties,
                   pipeline_metadata, media_id, processor_version, error_kind, created_at
            FROM token_processing_jobs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        super::health_check(&self.pool).await
    }
}
