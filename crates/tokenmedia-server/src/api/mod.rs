//! HTTP surface: health, token media reads, webhooks and task routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokenmedia_common::{Chain, TokenIdentifier};

use crate::db::TokenRepository;
use crate::error::AppError;
use crate::middleware;
use crate::pipeline::TokenProcessor;
use crate::tasks::{self, TaskClient};
use crate::webhooks;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn TokenRepository>,
    pub processor: Arc<TokenProcessor>,
    pub tasks: Arc<TaskClient>,
    pub webhook_secrets: Arc<Vec<String>>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/media/:chain/:contract/:token_id", get(get_token_media))
        .merge(webhooks::router())
        .merge(tasks::handlers::router())
        .with_state(state)
        .layer(middleware::tracing_layer())
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> Result<Response, StatusCode> {
    match state.repository.health_check().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response()),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Latest active media for a token, with the run that produced it
#[tracing::instrument(skip(state))]
async fn get_token_media(
    State(state): State<AppState>,
    Path((chain, contract, token_id)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let chain: Chain = chain
        .parse()
        .map_err(|_| AppError::Validation(format!("Unknown chain '{}'", chain)))?;
    let token = TokenIdentifier::parse(chain, &contract, &token_id)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let media = state
        .repository
        .get_token_media(&token)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No media for token {}", token)))?;
    let run = state.repository.get_job_run(media.processing_job_id).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "token": token.to_string(),
            "media": media,
            "properties": run.as_ref().map(|r| &r.properties.0),
            "processed_at": run.as_ref().map(|r| r.created_at),
        })),
    )
        .into_response())
}
