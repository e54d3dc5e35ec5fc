//! Client side of the CLIProxyAPI management API (`/v0/management`).

pub mod http;
pub mod logs;
pub mod types;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::CoreResult;
use crate::proxy::ProxyDefaults;

pub use http::HttpManagementClient;
pub use logs::{parse_log_line, LogEntry, LogLevel};
pub use types::{
    AIProvider, AccountStatus, AuthFile, LogBatch, ModelUsage, OAuthPollStatus, OAuthStart, UsageStats,
};

/// Operations the core needs from a running proxy. Implemented over HTTP by
/// [`HttpManagementClient`] and by scripted fakes in tests.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn list_auth_files(&self) -> CoreResult<Vec<AuthFile>>;
    async fn delete_auth_file(&self, name: &str) -> CoreResult<()>;
    async fn upload_auth_file(&self, provider: AIProvider, file_name: &str, content: Vec<u8>) -> CoreResult<()>;

    async fn usage_stats(&self) -> CoreResult<UsageStats>;

    async fn list_api_keys(&self) -> CoreResult<Vec<String>>;
    async fn add_api_key(&self, key: &str) -> CoreResult<()>;
    async fn update_api_key(&self, old: &str, new: &str) -> CoreResult<()>;
    async fn delete_api_key(&self, key: &str) -> CoreResult<()>;

    /// Lines newer than `after` (unix seconds); everything when `None`.
    async fn fetch_logs(&self, after: Option<i64>) -> CoreResult<LogBatch>;
    async fn clear_logs(&self) -> CoreResult<()>;

    async fn request_oauth_url(&self, provider: AIProvider, project_id: Option<&str>) -> CoreResult<OAuthStart>;
    async fn poll_oauth_status(&self, state: &str) -> CoreResult<OAuthPollStatus>;

    /// `PUT {path}` with `{"value": value}`.
    async fn put_setting(&self, path: &str, value: Value) -> CoreResult<()>;
}

/// Pushes the persisted runtime settings into a freshly started proxy.
/// Individual failures are logged; the proxy keeps its file defaults for
/// those keys.
pub async fn apply_runtime_settings(client: &dyn ManagementClient, defaults: &ProxyDefaults) -> usize {
    let settings = [
        ("request-retry", json!(defaults.request_retry)),
        ("routing/strategy", json!(defaults.routing_strategy)),
        ("quota-exceeded/switch-project", json!(defaults.quota_switch_project)),
        ("quota-exceeded/switch-preview-model", json!(defaults.quota_switch_preview_model)),
    ];

    let mut applied = 0;
    for (path, value) in settings {
        match client.put_setting(path, value).await {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("[management] Failed to apply {}: {}", path, e),
        }
    }
    applied
}
