//! Asynchronous task dispatch
//!
//! Work that must outlive a webhook or API request is handed to a task queue
//! as an HTTP request descriptor. The queue calls back into the task routes
//! in [`handlers`], retrying on non-2xx answers.
//!
//! With `CLOUD_TASKS_DIRECT_DISPATCH_ENABLED` the descriptor is instead sent
//! straight to the handler from a spawned task. Direct dispatch never
//! retries, so it is meant for local development and tests.

pub mod handlers;
pub mod payload;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::TasksConfig;

pub use payload::{MediaTask, TokenTransfer, TransferEvent, TransfersTask};

/// Header naming the queue a task was dispatched through
pub const QUEUE_NAME_HEADER: &str = "X-CloudTasks-QueueName";

/// Header carrying the task's unique name
pub const TASK_NAME_HEADER: &str = "X-CloudTasks-TaskName";

/// Prefix of names generated for tasks submitted without one
pub const GENERATED_NAME_PREFIX: &str = "direct-dispatch-";

pub const MEDIA_TASK_PATH: &str = "/tasks/media";
pub const TRANSFERS_TASK_PATH: &str = "/tasks/transfers";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Failed to encode task body: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Task queue rejected task ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// One task before it is handed to a back-end
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Handler path appended to `TOKEN_PROCESSING_URL`
    pub path: String,
    pub body: Vec<u8>,
    pub name: Option<String>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub dispatch_deadline: Option<Duration>,
}

impl TaskRequest {
    pub fn json<T: Serialize>(path: impl Into<String>, body: &T) -> Result<Self, TaskError> {
        Ok(Self {
            path: path.into(),
            body: serde_json::to_vec(body)?,
            name: None,
            schedule_time: None,
            dispatch_deadline: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_time = Some(at);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.dispatch_deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Serialize)]
struct HttpRequestDescriptor {
    http_method: &'static str,
    url: String,
    headers: BTreeMap<String, String>,
    /// Base64 of the request body
    body: String,
}

#[derive(Debug, Serialize)]
struct TaskDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    http_request: HttpRequestDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dispatch_deadline: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest {
    parent: String,
    task: TaskDescriptor,
}

/// Queue-or-direct task submitter
#[derive(Debug, Clone)]
pub struct TaskClient {
    http: reqwest::Client,
    processing_url: String,
    queue: String,
    queue_host: String,
    direct: bool,
    skip_queues: BTreeSet<String>,
}

impl TaskClient {
    pub fn new(http: reqwest::Client, config: &TasksConfig) -> Self {
        Self {
            http,
            processing_url: config.processing_url.trim_end_matches('/').to_string(),
            queue: config.processing_queue.clone(),
            queue_host: config.queue_host.trim_end_matches('/').to_string(),
            direct: config.direct_dispatch_enabled,
            skip_queues: config.skip_queues.clone(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub async fn submit_media(&self, task: &MediaTask) -> Result<Option<String>, TaskError> {
        self.submit(TaskRequest::json(MEDIA_TASK_PATH, task)?).await
    }

    pub async fn submit_transfers(&self, task: &TransfersTask) -> Result<Option<String>, TaskError> {
        self.submit(TaskRequest::json(TRANSFERS_TASK_PATH, task)?).await
    }

    /// Submit one task; returns its name, or `None` when the queue is skipped
    #[instrument(skip(self, request), fields(queue = %self.queue, path = %request.path, direct = self.direct))]
    pub async fn submit(&self, request: TaskRequest) -> Result<Option<String>, TaskError> {
        if self.skip_queues.contains(&self.queue) {
            debug!("Queue is skipped, dropping task");
            return Ok(None);
        }

        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("{}{}", GENERATED_NAME_PREFIX, Uuid::new_v4().simple()));

        if self.direct {
            self.dispatch_direct(request, name.clone());
        } else {
            self.enqueue(&request, &name).await?;
        }

        Ok(Some(name))
    }

    fn handler_url(&self, path: &str) -> String {
        format!("{}/{}", self.processing_url, path.trim_start_matches('/'))
    }

    fn task_headers(&self, name: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (QUEUE_NAME_HEADER.to_string(), self.queue.clone()),
            (TASK_NAME_HEADER.to_string(), name.to_string()),
        ])
    }

    async fn enqueue(&self, request: &TaskRequest, name: &str) -> Result<(), TaskError> {
        let create = CreateTaskRequest {
            parent: self.queue.clone(),
            task: TaskDescriptor {
                name: request.name.clone(),
                http_request: HttpRequestDescriptor {
                    http_method: "POST",
                    url: self.handler_url(&request.path),
                    headers: self.task_headers(name),
                    body: BASE64.encode(&request.body),
                },
                schedule_time: request.schedule_time.map(|t| t.to_rfc3339()),
                dispatch_deadline: request
                    .dispatch_deadline
                    .map(|d| format!("{}s", d.as_secs())),
            },
        };

        let endpoint = format!("{}/v2/{}/tasks", self.queue_host, self.queue);
        let response = self.http.post(&endpoint).json(&create).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TaskError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(task = %name, "Task enqueued");
        Ok(())
    }

    fn dispatch_direct(&self, request: TaskRequest, name: String) {
        let client = self.http.clone();
        let url = self.handler_url(&request.path);
        let headers = self.task_headers(&name);

        tokio::spawn(async move {
            if let Some(at) = request.schedule_time {
                if let Ok(wait) = (at - Utc::now()).to_std() {
                    tokio::time::sleep(wait).await;
                }
            }

            let mut builder = client.post(&url).body(request.body);
            for (key, value) in &headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            if let Some(deadline) = request.dispatch_deadline {
                builder = builder.timeout(deadline);
            }

            match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(task = %name, url = %url, "Direct task delivered");
                }
                Ok(response) => {
                    warn!(task = %name, url = %url, status = %response.status(), "Direct task failed");
                }
                Err(e) => {
                    warn!(task = %name, url = %url, error = %e, "Direct task request failed");
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::JobCause;
    use tokenmedia_common::{Chain, TokenIdentifier};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(queue_host: &str, processing_url: &str, direct: bool) -> TasksConfig {
        TasksConfig {
            processing_url: processing_url.to_string(),
            processing_queue: "token-processing".to_string(),
            queue_host: queue_host.to_string(),
            direct_dispatch_enabled: direct,
            skip_queues: BTreeSet::new(),
        }
    }

    fn media_task() -> MediaTask {
        let token = TokenIdentifier::parse(Chain::Ethereum, "0x00000000000000000000000000000000000000aa", "1")
            .unwrap();
        MediaTask::new(token, JobCause::Refresh)
    }

    #[tokio::test]
    async fn test_queue_mode_posts_descriptor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/token-processing/tasks"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = TaskClient::new(
            reqwest::Client::new(),
            &config(&server.uri(), "https://tokens.example.com/", false),
        );
        let name = client.submit_media(&media_task()).await.unwrap().unwrap();
        assert!(name.starts_with(GENERATED_NAME_PREFIX));

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["parent"], "token-processing");
        let http_request = &body["task"]["http_request"];
        assert_eq!(http_request["url"], "https://tokens.example.com/tasks/media");
        assert_eq!(http_request["headers"][QUEUE_NAME_HEADER], "token-processing");
        assert_eq!(http_request["headers"][TASK_NAME_HEADER], name.as_str());

        let decoded = BASE64.decode(http_request["body"].as_str().unwrap()).unwrap();
        let task: MediaTask = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(task, media_task());
    }

    #[tokio::test]
    async fn test_queue_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let client = TaskClient::new(reqwest::Client::new(), &config(&server.uri(), "http://h", false));
        let err = client.submit_media(&media_task()).await.unwrap_err();
        assert!(matches!(err, TaskError::Rejected { status: 429, .. }));
    }

    #[tokio::test]
    async fn test_direct_mode_calls_handler() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/media"))
            .and(header(QUEUE_NAME_HEADER, "token-processing"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = TaskClient::new(
            reqwest::Client::new(),
            &config("http://unused.invalid", &server.uri(), true),
        );
        client.submit_media(&media_task()).await.unwrap();

        let mut delivered = Vec::new();
        for _ in 0..50 {
            delivered = server.received_requests().await.unwrap();
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(delivered.len(), 1);
        let name = delivered[0].headers.get(TASK_NAME_HEADER).unwrap().to_str().unwrap();
        assert!(name.starts_with(GENERATED_NAME_PREFIX));
    }

    #[tokio::test]
    async fn test_skipped_queue_does_nothing() {
        let mut cfg = config("http://unused.invalid", "http://unused.invalid", false);
        cfg.skip_queues.insert("token-processing".to_string());
        let client = TaskClient::new(reqwest::Client::new(), &cfg);
        assert!(client.submit_media(&media_task()).await.unwrap().is_none());
    }
}
