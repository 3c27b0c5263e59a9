//! Router harness for handler tests

use crate::AppState;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use http_body_util::BodyExt;
use librarium_common::{
    config::{AppConfig, DatabaseConfig},
    db, AppError, DbPool, Dispatcher, ImportJobMessage, Repository, Result, UploadStorage,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "librarium-test-boundary";

/// Records every message instead of running it
pub struct RecordingDispatcher {
    reject: bool,
    messages: Mutex<Vec<ImportJobMessage>>,
}

impl RecordingDispatcher {
    pub fn messages(&self) -> Vec<ImportJobMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn enqueue(&self, message: ImportJobMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        if self.reject {
            return Err(AppError::ServiceUnavailable {
                message: "Import queue is full, try again later".to_string(),
            });
        }
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub dispatcher: Arc<RecordingDispatcher>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(AppConfig::default(), false).await
    }

    /// App whose dispatcher refuses every job
    pub async fn rejecting() -> Self {
        Self::build(AppConfig::default(), true).await
    }

    pub async fn with_upload_limit(max_upload_bytes: usize) -> Self {
        let mut config = AppConfig::default();
        config.import.max_upload_bytes = max_upload_bytes;
        Self::build(config, false).await
    }

    async fn build(mut config: AppConfig, reject: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();

        config.database = DatabaseConfig {
            url: format!("sqlite://{}/gateway.db?mode=rwc", dir.path().display()),
            max_connections: 1,
            min_connections: 1,
            ..DatabaseConfig::default()
        };
        config.import.upload_dir = dir.path().join("uploads");
        config.server.public_url = "http://books.test".to_string();

        let pool = DbPool::new(&config.database).await.unwrap();
        db::ensure_schema(pool.write()).await.unwrap();
        let storage = UploadStorage::open(config.import.upload_dir.clone()).await.unwrap();

        let dispatcher = Arc::new(RecordingDispatcher {
            reject,
            messages: Mutex::new(Vec::new()),
        });
        let shared: Arc<dyn Dispatcher> = dispatcher.clone();

        let state = AppState {
            config: Arc::new(config),
            repository: Repository::new(pool),
            storage,
            dispatcher: shared,
        };

        Self { state, dispatcher, _dir: dir }
    }

    pub fn repository(&self) -> &Repository {
        &self.state.repository
    }

    /// Send a request through a fresh router and decode the JSON body
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = crate::create_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Files currently held in upload storage
    pub fn stored_uploads(&self) -> usize {
        std::fs::read_dir(self.state.storage.root()).unwrap().count()
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// A multipart POST to the import endpoint with a single part
pub fn upload(field: &str, filename: Option<&str>, content_type: Option<&str>, contents: &[u8]) -> Request<Body> {
    let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", field);
    if let Some(filename) = filename {
        disposition.push_str(&format!("; filename=\"{}\"", filename));
    }

    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n{}\r\n", BOUNDARY, disposition).as_bytes());
    if let Some(content_type) = content_type {
        body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    }
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/import")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}
