#![allow(dead_code)]

use aigentic_server::agents::PLANNER_PROMPT;
use aigentic_server::build_router;
use aigentic_server::config::Config;
use aigentic_server::llm::{ChatMessage, CompletionBackend, LlmResponse, LlmSettings};
use aigentic_server::state::{AppState, AppStateInitOptions};
use aigentic_server::storage::{SqliteStorage, StorageBackend, TaskRecord};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

/// Echoes the last user message back and counts calls. The optional knobs script a planner
/// reply, failures and slow calls by matching text in the user message.
#[derive(Default)]
pub struct EchoBackend {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub plan: Option<String>,
    pub fail_on: Option<String>,
    pub slow_on: Option<(String, Duration)>,
}

impl EchoBackend {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_on: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn slow_on(marker: &str, delay: Duration) -> Self {
        Self {
            slow_on: Some((marker.to_string(), delay)),
            ..Self::default()
        }
    }

    pub fn with_plan(mut self, plan: Value) -> Self {
        self.plan = Some(plan.to_string());
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl CompletionBackend for EchoBackend {
    async fn complete(
        &self,
        settings: &LlmSettings,
        messages: &[ChatMessage],
    ) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.prompts.lock().push(prompt.clone());
        if let Some((marker, delay)) = &self.slow_on {
            if prompt.contains(marker.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        if let Some(marker) = &self.fail_on {
            if prompt.contains(marker.as_str()) {
                return Err(anyhow!("upstream model unavailable"));
            }
        }
        let planning = messages
            .first()
            .is_some_and(|message| message.content == PLANNER_PROMPT);
        let content = match (&self.plan, planning) {
            (Some(plan), true) => plan.clone(),
            _ => format!("echo: {prompt}"),
        };
        Ok(LlmResponse {
            content,
            model: settings.model.clone(),
            total_tokens: Some(7),
            mocked: false,
        })
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub llm: Arc<EchoBackend>,
    dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::with_backend(EchoBackend::default(), adjust)
    }

    pub fn with_backend(llm: EchoBackend, adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(llm, AppStateInitOptions::test_default(), adjust)
    }

    /// Jobs are accepted into the queue but never picked up.
    pub fn without_workers(adjust: impl FnOnce(&mut Config)) -> Self {
        let mut options = AppStateInitOptions::test_default();
        options.start_workers = false;
        Self::build(EchoBackend::default(), options, adjust)
    }

    pub fn build(
        llm: EchoBackend,
        options: AppStateInitOptions,
        adjust: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::open(dir, llm, options, adjust)
    }

    /// Starts an app over the database left in `dir` by an earlier app.
    pub fn open(
        dir: TempDir,
        llm: EchoBackend,
        options: AppStateInitOptions,
        adjust: impl FnOnce(&mut Config),
    ) -> Self {
        let db_path = dir.path().join("aigentic-test.db");
        let mut config = Config::default();
        config.environment = "development".to_string();
        config.security.secret_key = "integration-test-secret".to_string();
        config.security.seed_default_admin = false;
        config.worker.concurrency = 2;
        config.worker.task_timeout_s = 10;
        adjust(&mut config);

        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
        let llm = Arc::new(llm);
        let state = AppState::with_parts(config, storage, llm.clone(), options)
            .expect("app state");
        let state = Arc::new(state);
        let router = build_router(state.clone());
        Self {
            state,
            router,
            llm,
            dir,
        }
    }

    /// Stops the workers and hands back the database directory.
    pub fn shut_down(self) -> TempDir {
        let _ = self.state.shutdown_sender().send(true);
        self.dir
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(token), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, Some(token), None).await
    }

    /// Registers `username` and returns its access token.
    pub async fn signup(&self, username: &str) -> String {
        let (status, _) = self
            .request(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": "s3cret-pass",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = self
            .request(
                Method::POST,
                "/api/auth/login-json",
                None,
                Some(json!({ "username": username, "password": "s3cret-pass" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body["access_token"]
            .as_str()
            .expect("access token")
            .to_string()
    }

    /// Polls storage until the task reaches `status`.
    pub async fn wait_for_status(&self, task_id: i64, status: &str) -> TaskRecord {
        for _ in 0..200 {
            let task = self
                .state
                .storage
                .get_task(task_id)
                .expect("load task")
                .expect("task exists");
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    /// Polls storage until the task reaches a terminal status.
    pub async fn wait_for_task(&self, task_id: i64) -> TaskRecord {
        for _ in 0..200 {
            let task = self
                .state
                .storage
                .get_task(task_id)
                .expect("load task")
                .expect("task exists");
            if task.status == "completed" || task.status == "failed" {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} did not finish");
    }
}
