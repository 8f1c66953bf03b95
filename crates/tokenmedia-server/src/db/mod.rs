//! Relational persistence used by the pipeline and the task handlers
//!
//! # Operations
//!
//! - `insert_token_pipeline_results()` - Record one run and its media version
//! - `get_split_by_address()` - Resolve a pool contract
//! - `remove_wallet_from_tokens()` - Detach a wallet from a user's tokens
//! - `get_token_metadata()` - Shared metadata of a contract
//! - `get_token_definition()` / `get_token_media()` - Lookups by token identifier
//!
//! Every operation is a single statement; callers never hold a transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tokenmedia_common::{Address, Chain, TokenIdentifier, TokenMetadata};
use uuid::Uuid;

use crate::config::DatabaseConfig;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryRepository;
pub use models::{
    JobRunRecord, OwnedToken, PipelineResults, Split, SplitRecipient, TokenDefinition, TokenMedia,
    TokenMediaRow, TokenProperties,
};
pub use postgres::PgRepository;

/// Max connection lifetime
const MAX_LIFETIME_SECS: u64 = 1800;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Database configuration error: {0}. Check DATABASE_URL and connection settings.")]
    Config(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Database unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn not_found(resource_type: &str, identifier: &str) -> Self {
        Self::NotFound(format!("{} '{}' not found in database", resource_type, identifier))
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Insert the run row, the new active media version (deactivating the
    /// previous one) and refresh the token definition, atomically.
    async fn insert_token_pipeline_results(
        &self,
        results: PipelineResults,
    ) -> RepositoryResult<Option<TokenMediaRow>>;

    async fn get_split_by_address(
        &self,
        chain: Chain,
        address: &Address,
    ) -> RepositoryResult<Option<Split>>;

    /// Returns the number of tokens touched
    async fn remove_wallet_from_tokens(&self, wallet_id: Uuid, user_id: Uuid)
        -> RepositoryResult<u64>;

    /// Metadata shared by a contract, taken from its most recently described token
    async fn get_token_metadata(
        &self,
        chain: Chain,
        contract: &Address,
    ) -> RepositoryResult<Option<TokenMetadata>>;

    async fn get_token_definition(
        &self,
        token: &TokenIdentifier,
    ) -> RepositoryResult<Option<TokenDefinition>>;

    /// The active media row
    async fn get_token_media(&self, token: &TokenIdentifier)
        -> RepositoryResult<Option<TokenMediaRow>>;

    async fn get_job_run(&self, run_id: Uuid) -> RepositoryResult<Option<JobRunRecord>>;

    async fn health_check(&self) -> RepositoryResult<()>;
}

pub async fn create_pool(config: &DatabaseConfig) -> RepositoryResult<PgPool> {
    if config.url.is_empty() {
        return Err(RepositoryError::Config("DATABASE_URL not set".to_string()));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(MAX_LIFETIME_SECS))
        .connect(&config.url)
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> RepositoryResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(RepositoryError::from)
}
