//! Router tests: health, media reads, webhooks and task handlers

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use common::{png, token, Harness};
use serde_json::{json, Value};
use sqlx::types::Json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokenmedia_server::{
    api::{create_router, AppState},
    config::TasksConfig,
    db::{OwnedToken, Split},
    pipeline::TokenLock,
    tasks::{TaskClient, QUEUE_NAME_HEADER, TASK_NAME_HEADER},
};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_test";
const POOL: &str = "0x00000000000000000000000000000000000000b0";

struct App {
    harness: Harness,
    queue: MockServer,
    router: Router,
}

async fn app() -> App {
    let harness = Harness::start().await;
    let queue = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/token-processing/tasks"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&queue)
        .await;

    let tasks = TaskClient::new(
        reqwest::Client::new(),
        &TasksConfig {
            processing_url: "https://tokens.test".to_string(),
            processing_queue: "token-processing".to_string(),
            queue_host: queue.uri(),
            direct_dispatch_enabled: false,
            skip_queues: BTreeSet::new(),
        },
    );

    let state = AppState {
        repository: harness.repository.clone(),
        processor: harness.processor.clone(),
        tasks: Arc::new(tasks),
        webhook_secrets: Arc::new(vec![SECRET.to_string()]),
    };

    App {
        router: create_router(state),
        harness,
        queue,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
}

fn webhook(uri: &str, secret: &str, body: &Value) -> Request<Body> {
    post(uri)
        .header(header::AUTHORIZATION, format!("Basic {}", BASE64.encode(format!("{}:", secret))))
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn task(uri: &str, body: &Value) -> Request<Body> {
    post(uri)
        .header(QUEUE_NAME_HEADER, "token-processing")
        .header(TASK_NAME_HEADER, "task-1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn activity(to: &str, token_id: Option<&str>) -> Value {
    let mut item = json!({
        "fromAddress": "0x0000000000000000000000000000000000000001",
        "toAddress": to,
        "rawContract": {"address": "0x00000000000000000000000000000000000000aa"},
        "value": "0x1"
    });
    if let Some(id) = token_id {
        item["erc721TokenId"] = json!(id);
    }
    item
}

async fn queued_bodies(queue: &MockServer) -> Vec<Value> {
    queue
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            let descriptor: Value = serde_json::from_slice(&r.body).unwrap();
            let encoded = descriptor["task"]["http_request"]["body"].as_str().unwrap().to_string();
            serde_json::from_slice(&BASE64.decode(encoded).unwrap()).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let get = || Request::builder().uri("/health").body(Body::empty()).unwrap();

    let (status, body) = send(&app.router, get()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    app.harness.repository.fail_writes(true);
    let (status, _) = send(&app.router, get()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_webhook_auth_failures_answer_200() {
    let app = app().await;
    let body = json!({"event": {"network": "ETH_MAINNET", "activity": [activity(POOL, Some("1"))]}});

    let (status, reply) = send(&app.router, webhook("/token/transfer", "wrong", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["error"], "unauthorized");

    let malformed = post("/token/transfer")
        .header(header::AUTHORIZATION, format!("Basic {}", BASE64.encode(format!("{}:", SECRET))))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, reply) = send(&app.router, malformed).await;
    assert_eq!(status, StatusCode::OK);
    assert!(reply["error"].as_str().unwrap().starts_with("malformed body"));

    assert!(app.queue.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_webhook_fans_out_transfers() {
    let app = app().await;
    let body = json!({"event": {"network": "BASE_MAINNET", "activity": [
        activity(POOL, Some("0x1")),
        activity(POOL, Some("0x2")),
    ]}});

    let (status, reply) = send(&app.router, webhook("/token/transfer", SECRET, &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply, json!({"success": true}));

    let queued = queued_bodies(&app.queue).await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["event"], "token_transfer");
    assert_eq!(queued[0]["transfers"].as_array().unwrap().len(), 2);
    assert_eq!(queued[0]["transfers"][0]["chain"], "base");
}

#[tokio::test]
async fn test_pool_routes_tag_their_event() {
    let app = app().await;
    let body = json!({"event": {"network": "ETH_MAINNET", "activity": [activity(POOL, None)]}});

    for (uri, event) in [
        ("/pool/publish", "pool_publish"),
        ("/pool/recipient/update", "pool_recipient_update"),
        ("/pool/owner/delete", "pool_owner_delete"),
    ] {
        let (status, _) = send(&app.router, webhook(uri, SECRET, &body)).await;
        assert_eq!(status, StatusCode::OK);
        let queued = queued_bodies(&app.queue).await;
        assert_eq!(queued.last().unwrap()["event"], event);
    }
}

#[tokio::test]
async fn test_media_task_requires_queue_headers() {
    let app = app().await;
    let body = json!({"chain": "ethereum", "contract": token().contract, "token_id": "1", "cause": "refresh"});

    let request = post("/tasks/media").body(Body::from(body.to_string())).unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_media_task_runs_pipeline() {
    let app = app().await;
    app.harness.serve("/a.png", "image/png", png(2, 2)).await;
    let body = json!({
        "chain": "ethereum",
        "contract": token().contract,
        "token_id": "1",
        "cause": "refresh",
        "options": {"starting_metadata": {"name": "A", "image": app.harness.url("/a.png")}}
    });

    let (status, reply) = send(&app.router, task("/tasks/media", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["success"], true);
    assert_eq!(reply["properties"]["has_primary_media"], true);

    let read = Request::builder()
        .uri(format!("/media/ethereum/{}/1", token().contract))
        .body(Body::empty())
        .unwrap();
    let (status, reply) = send(&app.router, read).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["media"]["media"]["media_type"], "image");
    assert_eq!(reply["properties"]["has_name"], true);
}

#[tokio::test]
async fn test_terminal_job_errors_are_acknowledged() {
    let app = app().await;
    let body = json!({
        "chain": "ethereum",
        "contract": token().contract,
        "token_id": "1",
        "cause": "refresh",
        "options": {
            "require_image": true,
            "starting_metadata": {"image": app.harness.url("/missing.png")}
        }
    });

    let (status, reply) = send(&app.router, task("/tasks/media", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error_kind"], "image_result_required");
}

#[tokio::test]
async fn test_busy_token_asks_for_redelivery() {
    let app = app().await;
    let held = app
        .harness
        .lock
        .try_acquire(&token().lock_key(), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(held.is_some());
    let body = json!({"chain": "ethereum", "contract": token().contract, "token_id": "1", "cause": "refresh"});

    let (status, reply) = send(&app.router, task("/tasks/media", &body)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply["error"]["status"], 503);
}

#[tokio::test]
async fn test_media_read_not_found_and_bad_chain() {
    let app = app().await;
    let get = |uri: String| Request::builder().uri(uri).body(Body::empty()).unwrap();

    let (status, _) = send(&app.router, get(format!("/media/ethereum/{}/9", token().contract))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.router, get(format!("/media/dogechain/{}/9", token().contract))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_transfers_task_dispatches_media_jobs() {
    let app = app().await;
    let transfer = |id: Option<&str>| {
        let mut t = json!({
            "from": "0x0000000000000000000000000000000000000001",
            "to": POOL,
            "contract": token().contract,
            "chain": "ethereum",
            "amount": "0x1"
        });
        if let Some(id) = id {
            t["token_id"] = json!(id);
        }
        t
    };
    let body = json!({
        "event": "token_transfer",
        "transfers": [transfer(Some("0x1")), transfer(Some("1")), transfer(Some("0x2")), transfer(None)]
    });

    let (status, reply) = send(&app.router, task("/tasks/transfers", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["media_tasks"], 2);

    let queued = queued_bodies(&app.queue).await;
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|t| t["cause"] == "transfer"));
}

#[tokio::test]
async fn test_pool_deactivation_detaches_owner_wallet() {
    let app = app().await;
    let user = Uuid::new_v4();
    let wallet = Uuid::new_v4();
    app.harness.repository.insert_split(Split {
        id: Uuid::new_v4(),
        chain: "ethereum".to_string(),
        address: POOL.to_string(),
        name: Some("Pool".to_string()),
        owner_user_id: Some(user),
        owner_wallet_id: Some(wallet),
        recipients: Json(Vec::new()),
        deleted: false,
        created_at: Utc::now(),
    });
    app.harness.repository.insert_owned_token(OwnedToken {
        id: Uuid::new_v4(),
        chain: "ethereum".to_string(),
        contract: token().contract.to_string(),
        token_id: "0x1".to_string(),
        owner_user_id: user,
        owned_by_wallets: vec![wallet],
    });

    let body = json!({
        "event": "pool_deactivate",
        "transfers": [{
            "from": POOL,
            "to": "0x0000000000000000000000000000000000000000",
            "contract": token().contract,
            "chain": "ethereum",
            "amount": "0x0"
        }]
    });

    let (status, reply) = send(&app.router, task("/tasks/transfers", &body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["pools"], 1);
    assert_eq!(reply["tokens_detached"], 1);
    assert!(app.harness.repository.owned_tokens()[0].owned_by_wallets.is_empty());
}
