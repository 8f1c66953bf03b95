//! Persisted rows and the values written into them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use tokenmedia_common::{Address, Chain, Dimensions, MediaType, TokenIdentifier, TokenMetadata};
use uuid::Uuid;

use crate::pipeline::metadata::PipelineMetadata;

/// What clients render for a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMedia {
    pub media_type: MediaType,
    /// Primary media as found in metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Still fallback when the primary is animated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_render_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub dimensions: Dimensions,
}

/// Flags clients use to choose fallback UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenProperties {
    pub has_metadata: bool,
    pub has_primary_media: bool,
    pub has_thumbnail: bool,
    pub has_live_render: bool,
    pub has_dimensions: bool,
    pub has_name: bool,
    pub has_description: bool,
}

impl TokenProperties {
    pub fn derive(metadata: &TokenMetadata, media: Option<&TokenMedia>) -> Self {
        let mut properties = TokenProperties {
            has_metadata: !metadata.is_empty(),
            has_name: metadata.name().is_some(),
            has_description: metadata.description().is_some(),
            ..TokenProperties::default()
        };

        if let Some(media) = media {
            properties.has_primary_media = media.media_url.is_some() && media.media_type.is_valid();
            properties.has_thumbnail =
                media.cached_thumbnail_url.is_some() || media.thumbnail_url.is_some();
            properties.has_live_render = media.live_render_url.is_some();
            properties.has_dimensions = media.dimensions.is_valid();
        }

        properties
    }
}

/// Everything one run writes
#[derive(Debug, Clone)]
pub struct PipelineResults {
    pub run_id: Uuid,
    pub token: TokenIdentifier,
    pub cause: String,
    pub metadata: TokenMetadata,
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: TokenProperties,
    pub pipeline_metadata: PipelineMetadata,
    /// `None` when the run produced nothing worth showing
    pub media: Option<TokenMedia>,
    pub processor_version: String,
    pub error_kind: Option<String>,
}

/// One version of a token's media; the newest row is active
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TokenMediaRow {
    pub id: Uuid,
    pub chain: String,
    pub contract: String,
    pub token_id: String,
    pub active: bool,
    pub media: Json<TokenMedia>,
    pub processing_job_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Outcome row of one pipeline run
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobRunRecord {
    pub id: Uuid,
    pub chain: String,
    pub contract: String,
    pub token_id: String,
    pub cause: String,
    pub metadata: Json<JsonValue>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: Json<TokenProperties>,
    pub pipeline_metadata: Json<PipelineMetadata>,
    pub media_id: Option<Uuid>,
    pub processor_version: String,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobRunRecord {
    pub fn token_metadata(&self) -> TokenMetadata {
        TokenMetadata::from_value(self.metadata.0.clone()).unwrap_or_default()
    }
}

/// Latest known descriptive state of a token
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TokenDefinition {
    pub id: Uuid,
    pub chain: String,
    pub contract: String,
    pub token_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Json<JsonValue>,
    pub media_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRecipient {
    pub address: String,
    /// Basis points
    pub allocation: i64,
}

/// A revenue-split pool contract
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Split {
    pub id: Uuid,
    pub chain: String,
    pub address: String,
    pub name: Option<String>,
    pub owner_user_id: Option<Uuid>,
    pub owner_wallet_id: Option<Uuid>,
    pub recipients: Json<Vec<SplitRecipient>>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Token ownership as tracked for users
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OwnedToken {
    pub id: Uuid,
    pub chain: String,
    pub contract: String,
    pub token_id: String,
    pub owner_user_id: Uuid,
    pub owned_by_wallets: Vec<Uuid>,
}

/// Column values for a token identifier
pub(crate) fn identifier_columns(token: &TokenIdentifier) -> (&'static str, &str, &str) {
    (
        token.chain.as_str(),
        token.contract.as_str(),
        token.token_id.as_str(),
    )
}

pub(crate) fn address_columns(chain: Chain, address: &Address) -> (&'static str, &str) {
    (chain.as_str(), address.as_str())
}
