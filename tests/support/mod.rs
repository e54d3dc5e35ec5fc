#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use proxypal_core::events::{BrowserOpener, NotificationEvent, StatusChangeNotifier};
use proxypal_core::management::{
    AIProvider, AuthFile, LogBatch, LogEntry, LogLevel, ManagementClient, OAuthPollStatus, OAuthStart,
    UsageStats,
};
use proxypal_core::refresh::{CategoryQuota, QuotaCategory, QuotaSource, RefreshTrigger};
use proxypal_core::{CoreError, CoreResult};

pub fn auth_file(provider: &str, email: &str, status: &str) -> AuthFile {
    AuthFile {
        id: format!("{}-{}.json", provider, email),
        name: format!("{}-{}.json", provider, email),
        provider: provider.to_string(),
        label: None,
        status: status.to_string(),
        status_message: None,
        disabled: false,
        unavailable: false,
        email: Some(email.to_string()),
        account_type: None,
        last_refresh: None,
    }
}

pub fn log_entry(message: &str) -> LogEntry {
    LogEntry {
        timestamp: String::new(),
        level: LogLevel::Info,
        message: message.to_string(),
    }
}

/// Scripted management API. Failures are configured as messages and
/// surface as `CoreError::Network`.
#[derive(Default)]
pub struct FakeManagement {
    pub auth_files: Mutex<Vec<AuthFile>>,
    pub auth_files_error: Mutex<Option<String>>,
    pub usage_error: Mutex<Option<String>>,
    pub api_keys: Mutex<Vec<String>>,
    pub log_batches: Mutex<VecDeque<LogBatch>>,
    pub log_requests: Mutex<Vec<Option<i64>>>,
    pub oauth_url_error: Mutex<Option<String>>,
    pub poll_script: Mutex<VecDeque<Result<OAuthPollStatus, String>>>,
    pub uploads: Mutex<Vec<(AIProvider, String, Vec<u8>)>>,
    pub settings: Mutex<Vec<(String, Value)>>,
    pub auth_file_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
}

impl FakeManagement {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_auth_files(&self, files: Vec<AuthFile>) {
        *self.auth_files.lock().unwrap() = files;
    }

    pub fn fail_usage(&self, message: Option<&str>) {
        *self.usage_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn fail_auth_files(&self, message: Option<&str>) {
        *self.auth_files_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn script_polls(&self, statuses: impl IntoIterator<Item = OAuthPollStatus>) {
        self.poll_script.lock().unwrap().extend(statuses.into_iter().map(Ok));
    }

    /// Queues `count` transport failures ahead of any later scripted polls.
    pub fn fail_polls(&self, count: usize, message: &str) {
        self.poll_script
            .lock()
            .unwrap()
            .extend((0..count).map(|_| Err(message.to_string())));
    }

    pub fn push_logs(&self, batch: LogBatch) {
        self.log_batches.lock().unwrap().push_back(batch);
    }

    fn scripted_error(slot: &Mutex<Option<String>>) -> CoreResult<()> {
        match slot.lock().unwrap().clone() {
            Some(message) => Err(CoreError::Network(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ManagementClient for FakeManagement {
    async fn list_auth_files(&self) -> CoreResult<Vec<AuthFile>> {
        self.auth_file_calls.fetch_add(1, Ordering::SeqCst);
        Self::scripted_error(&self.auth_files_error)?;
        Ok(self.auth_files.lock().unwrap().clone())
    }

    async fn delete_auth_file(&self, name: &str) -> CoreResult<()> {
        self.auth_files.lock().unwrap().retain(|f| f.name != name);
        Ok(())
    }

    async fn upload_auth_file(&self, provider: AIProvider, file_name: &str, content: Vec<u8>) -> CoreResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((provider, file_name.to_string(), content));
        Ok(())
    }

    async fn usage_stats(&self) -> CoreResult<UsageStats> {
        Self::scripted_error(&self.usage_error)?;
        Ok(UsageStats {
            total_requests: 10,
            success_count: 9,
            failure_count: 1,
            ..Default::default()
        })
    }

    async fn list_api_keys(&self) -> CoreResult<Vec<String>> {
        Ok(self.api_keys.lock().unwrap().clone())
    }

    async fn add_api_key(&self, key: &str) -> CoreResult<()> {
        self.api_keys.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn update_api_key(&self, old: &str, new: &str) -> CoreResult<()> {
        for key in self.api_keys.lock().unwrap().iter_mut() {
            if key == old {
                *key = new.to_string();
            }
        }
        Ok(())
    }

    async fn delete_api_key(&self, key: &str) -> CoreResult<()> {
        self.api_keys.lock().unwrap().retain(|k| k != key);
        Ok(())
    }

    async fn fetch_logs(&self, after: Option<i64>) -> CoreResult<LogBatch> {
        self.log_requests.lock().unwrap().push(after);
        Ok(self.log_batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn clear_logs(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn request_oauth_url(&self, provider: AIProvider, _project_id: Option<&str>) -> CoreResult<OAuthStart> {
        Self::scripted_error(&self.oauth_url_error)?;
        Ok(OAuthStart {
            url: format!("https://auth.example.com/{}", provider),
            state: format!("state-{}", provider),
        })
    }

    async fn poll_oauth_status(&self, _state: &str) -> CoreResult<OAuthPollStatus> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.poll_script.lock().unwrap().pop_front();
        match next {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(CoreError::Network(message)),
            None => Ok(OAuthPollStatus::Pending("wait".to_string())),
        }
    }

    async fn put_setting(&self, path: &str, value: Value) -> CoreResult<()> {
        self.settings.lock().unwrap().push((path.to_string(), value));
        Ok(())
    }
}

/// Quota backend returning scripted results in order, repeating the last.
pub struct FakeQuotaSource {
    category: QuotaCategory,
    script: Mutex<VecDeque<Result<CategoryQuota, String>>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeQuotaSource {
    pub fn new(category: QuotaCategory, script: Vec<Result<CategoryQuota, String>>) -> Arc<Self> {
        Self::with_delay(category, script, Duration::ZERO)
    }

    pub fn with_delay(
        category: QuotaCategory,
        script: Vec<Result<CategoryQuota, String>>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            category,
            script: Mutex::new(script.into()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuotaSource for FakeQuotaSource {
    fn category(&self) -> QuotaCategory {
        self.category
    }

    async fn fetch(&self) -> CoreResult<CategoryQuota> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match next {
            Some(Ok(data)) => Ok(data),
            Some(Err(message)) => Err(CoreError::Network(message)),
            None => Ok(HashMap::new()),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<NotificationEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl StatusChangeNotifier for RecordingNotifier {
    fn notify(&self, event: NotificationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct RecordingOpener {
    pub urls: Mutex<Vec<String>>,
}

impl RecordingOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BrowserOpener for RecordingOpener {
    fn open_url(&self, url: &str) -> CoreResult<()> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingTrigger {
    pub count: AtomicUsize,
}

#[async_trait]
impl RefreshTrigger for CountingTrigger {
    async fn trigger_refresh(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writes an executable shell script standing in for the proxy binary.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl Route {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct ServerState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

/// Local axum server answering from a path-keyed route table (query
/// excluded) and recording every request it sees.
pub struct TestServer {
    pub base: String,
    state: ServerState,
}

impl TestServer {
    pub async fn start(routes: HashMap<String, Route>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let state = ServerState {
            requests: Arc::default(),
            routes: Arc::new(Mutex::new(routes)),
        };
        let app = Router::new().fallback(respond).with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { base, state }
    }

    /// Adds or replaces a route; useful when a body must embed `base`.
    pub fn route(&self, path: &str, route: Route) {
        self.state.routes.lock().unwrap().insert(path.to_string(), route);
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn respond(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let route = state
        .routes
        .lock()
        .unwrap()
        .get(uri.path())
        .cloned()
        .unwrap_or_else(|| Route::status(404, "not found"));
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        target: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        headers,
        body: body.to_vec(),
    });

    if !route.delay.is_zero() {
        tokio::time::sleep(route.delay).await;
    }
    let status = StatusCode::from_u16(route.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], route.body).into_response()
}
