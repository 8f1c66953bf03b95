//! Address activity webhooks
//!
//! The vendor treats any non-200 answer as undelivered and retries, so these
//! routes always answer `200`: `{"success": true}` once the transfers are
//! handed to the task queue, `{"error": ".."}` otherwise.

pub mod event;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::tasks::{TransferEvent, TransfersTask};

pub use event::{Network, WebhookPayload};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/token/transfer", post(token_transfer))
        .route("/pool/publish", post(pool_publish))
        .route("/pool/activate", post(pool_activate))
        .route("/pool/deactivate", post(pool_deactivate))
        .route("/pool/recipient/create", post(pool_recipient_create))
        .route("/pool/recipient/update", post(pool_recipient_update))
        .route("/pool/recipient/delete", post(pool_recipient_delete))
        .route("/pool/owner/update", post(pool_owner_update))
        .route("/pool/owner/delete", post(pool_owner_delete))
}

/// `Authorization: Basic base64("<secret>:")` for any configured secret
pub fn is_authorized(headers: &HeaderMap, secrets: &[String]) -> bool {
    let Some(encoded) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let secret = credentials.split_once(':').map_or(credentials.as_str(), |(user, _)| user);

    // Constant time, and no early exit across secrets
    let matched = secrets.iter().fold(Choice::from(0), |matched, s| {
        matched | s.as_bytes().ct_eq(secret.as_bytes())
    });
    !secret.is_empty() && bool::from(matched)
}

fn reply(body: serde_json::Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn rejected(message: &str) -> Response {
    reply(json!({ "error": message }))
}

#[tracing::instrument(skip(state, headers, body), fields(event = %event))]
async fn handle(state: AppState, event: TransferEvent, headers: HeaderMap, body: Bytes) -> Response {
    if !is_authorized(&headers, &state.webhook_secrets) {
        warn!("Webhook rejected: bad credentials");
        return rejected("unauthorized");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "Malformed webhook body");
            return rejected(&format!("malformed body: {}", e));
        }
    };

    let transfers = payload.transfers();
    if transfers.is_empty() {
        return reply(json!({ "success": true }));
    }

    let count = transfers.len();
    match state.tasks.submit_transfers(&TransfersTask { event, transfers }).await {
        Ok(task) => {
            info!(transfers = count, task = ?task, "Webhook transfers dispatched");
            reply(json!({ "success": true }))
        }
        Err(e) => {
            warn!(error = %e, "Failed to dispatch webhook transfers");
            rejected("failed to dispatch transfers")
        }
    }
}

async fn token_transfer(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, TransferEvent::TokenTransfer, headers, body).await
}

async fn pool_publish(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, TransferEvent::PoolPublish, headers, body).await
}

async fn pool_activate(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, TransferEvent::PoolActivate, headers, body).await
}

async fn pool_deactivate(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, TransferEvent::PoolDeactivate, headers, body).await
}

async fn pool_recipient_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, TransferEvent::PoolRecipientCreate, headers, body).await
}

async fn pool_recipient_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, TransferEvent::PoolRecipientUpdate, headers, body).await
}

async fn pool_recipient_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, TransferEvent::PoolRecipientDelete, headers, body).await
}

async fn pool_owner_update(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, TransferEvent::PoolOwnerUpdate, headers, body).await
}

async fn pool_owner_delete(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, TransferEvent::PoolOwnerDelete, headers, body).await
}
