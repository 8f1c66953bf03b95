//! Routes the task queue delivers to
//!
//! A `2xx` answer acknowledges the task; anything else makes the queue
//! redeliver it. Terminal pipeline errors are therefore answered with `200`.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::collections::BTreeSet;
use tokenmedia_common::{Chain, TokenIdentifier};
use tracing::{debug, info, warn};

use super::payload::{MediaTask, TokenTransfer, TransferEvent, TransfersTask};
use super::{MEDIA_TASK_PATH, QUEUE_NAME_HEADER, TASK_NAME_HEADER, TRANSFERS_TASK_PATH};
use crate::api::AppState;
use crate::db::Split;
use crate::error::AppError;
use crate::pipeline::JobCause;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(MEDIA_TASK_PATH, post(process_media))
        .route(TRANSFERS_TASK_PATH, post(process_transfers))
}

/// Queue and task name of a delivered task
fn task_headers(headers: &HeaderMap) -> Result<(String, String), AppError> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest(format!("Missing {} header", name)))
    };
    Ok((read(QUEUE_NAME_HEADER)?, read(TASK_NAME_HEADER)?))
}

#[tracing::instrument(skip(state, headers, task), fields(token = %task.token(), cause = %task.cause))]
pub async fn process_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<MediaTask>,
) -> Result<Response, AppError> {
    let (queue, task_name) = task_headers(&headers)?;
    debug!(queue = %queue, task = %task_name, "Media task received");

    let outcome = match state.processor.process(task.into_job()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return Err(AppError::from_retryable(&e).unwrap_or_else(|| AppError::Internal(e.to_string())))
        }
    };

    if let Some(e) = &outcome.error {
        if let Some(retry) = AppError::from_retryable(e) {
            return Err(retry);
        }
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": outcome.error.is_none(),
            "run_id": outcome.run_id,
            "error": outcome.error.as_ref().map(|e| e.to_string()),
            "error_kind": outcome.error.as_ref().map(|e| e.kind()),
            "properties": outcome.properties,
            "media": outcome.media.as_ref().map(|row| &row.media.0),
        })),
    )
        .into_response())
}

#[tracing::instrument(skip(state, headers, task), fields(event = %task.event, transfers = task.transfers.len()))]
pub async fn process_transfers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(task): Json<TransfersTask>,
) -> Result<Response, AppError> {
    let (queue, task_name) = task_headers(&headers)?;
    debug!(queue = %queue, task = %task_name, "Transfers task received");

    let body = match task.event {
        TransferEvent::TokenTransfer => {
            let dispatched = dispatch_media_refreshes(&state, &task.transfers).await?;
            json!({ "success": true, "media_tasks": dispatched })
        }
        event => {
            let mut pools = 0usize;
            let mut detached = 0u64;
            for transfer in &task.transfers {
                let Some(split) = find_split(&state, transfer).await? else {
                    debug!(to = %transfer.to, from = %transfer.from, "No pool for activity");
                    continue;
                };
                pools += 1;
                info!(pool = %split.address, event = %event, "Pool event");

                if event.detaches_owner() {
                    if let (Some(wallet), Some(user)) = (split.owner_wallet_id, split.owner_user_id) {
                        detached += state.repository.remove_wallet_from_tokens(wallet, user).await?;
                    } else {
                        warn!(pool = %split.address, "Pool has no owner wallet to detach");
                    }
                }
            }
            json!({ "success": true, "pools": pools, "tokens_detached": detached })
        }
    };

    Ok((StatusCode::OK, Json(body)).into_response())
}

/// One media task per distinct token carried by the transfers
async fn dispatch_media_refreshes(
    state: &AppState,
    transfers: &[TokenTransfer],
) -> Result<usize, AppError> {
    let tokens: BTreeSet<TokenIdentifier> = transfers.iter().filter_map(TokenTransfer::token).collect();
    for token in &tokens {
        state
            .tasks
            .submit_media(&MediaTask::new(token.clone(), JobCause::Transfer))
            .await?;
    }
    Ok(tokens.len())
}

/// The pool is whichever side of the activity is a known split
async fn find_split(state: &AppState, transfer: &TokenTransfer) -> Result<Option<Split>, AppError> {
    let chain: Chain = transfer.chain;
    for address in [&transfer.to, &transfer.from] {
        if address.is_zero() {
            continue;
        }
        if let Some(split) = state.repository.get_split_by_address(chain, address).await? {
            return Ok(Some(split));
        }
    }
    Ok(None)
}
