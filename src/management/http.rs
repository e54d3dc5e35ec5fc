use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use super::logs::{parse_lines, LogsResponse};
use super::types::{AIProvider, AuthFile, LogBatch, OAuthPollStatus, OAuthStart, UsageStats};
use super::ManagementClient;
use crate::error::{CoreError, CoreResult};

const MANAGEMENT_KEY_HEADER: &str = "X-Management-Key";

/// reqwest implementation against `http://127.0.0.1:{port}/v0/management/`.
#[derive(Clone)]
pub struct HttpManagementClient {
    http: reqwest::Client,
    base: Url,
    secret_key: String,
}

impl HttpManagementClient {
    pub fn new(port: u16, secret_key: impl Into<String>, timeout: Duration) -> CoreResult<Self> {
        let base = Url::parse(&format!("http://127.0.0.1:{}/v0/management/", port))
            .map_err(|e| CoreError::Network(format!("invalid management URL: {}", e)))?;
        Self::with_base_url(base, secret_key, timeout)
    }

    /// `base` must end with a slash so endpoint paths join beneath it.
    pub fn with_base_url(base: Url, secret_key: impl Into<String>, timeout: Duration) -> CoreResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            secret_key: secret_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> CoreResult<Url> {
        self.base
            .join(path)
            .map_err(|e| CoreError::Network(format!("invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(MANAGEMENT_KEY_HEADER, &self.secret_key)
    }

    async fn send(&self, builder: RequestBuilder, action: &str) -> CoreResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("Failed to {}: {}", action, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::Network(format!("Failed to {}: {} - {}", action, status, text)));
        }
        Ok(response)
    }

    async fn send_json(&self, builder: RequestBuilder, action: &str) -> CoreResult<Value> {
        self.send(builder, action)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| CoreError::Network(format!("Failed to parse {} response: {}", action, e)))
    }

    async fn put_api_keys(&self, keys: &[String]) -> CoreResult<()> {
        let url = self.endpoint("api-keys")?;
        self.send(self.request(Method::PUT, url).json(&keys), "save API keys")
            .await?;
        Ok(())
    }
}

/// Accepts a bare array or one wrapped as `{ "<key>": [...] }`; `null` reads
/// as empty.
fn unwrap_list(body: Value, wrapper_key: &str) -> Value {
    match body {
        Value::Object(mut obj) => match obj.remove(wrapper_key) {
            Some(Value::Null) | None => Value::Array(Vec::new()),
            Some(inner) => inner,
        },
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn list_auth_files(&self) -> CoreResult<Vec<AuthFile>> {
        let url = self.endpoint("auth-files")?;
        let body = self.send_json(self.request(Method::GET, url), "list auth files").await?;
        serde_json::from_value(unwrap_list(body, "files"))
            .map_err(|e| CoreError::Network(format!("Failed to parse auth files: {}", e)))
    }

    async fn delete_auth_file(&self, name: &str) -> CoreResult<()> {
        let mut url = self.endpoint("auth-files")?;
        url.query_pairs_mut().append_pair("name", name);
        self.send(self.request(Method::DELETE, url), "delete auth file").await?;
        Ok(())
    }

    async fn upload_auth_file(&self, provider: AIProvider, file_name: &str, content: Vec<u8>) -> CoreResult<()> {
        let url = self.endpoint("auth-files")?;
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str("application/json")?;
        let form = reqwest::multipart::Form::new()
            .text("provider", provider.as_str().to_string())
            .text("filename", file_name.to_string())
            .part("file", part);

        self.send(self.request(Method::POST, url).multipart(form), "upload auth file")
            .await?;
        Ok(())
    }

    async fn usage_stats(&self) -> CoreResult<UsageStats> {
        let url = self.endpoint("usage")?;
        let body = self.send_json(self.request(Method::GET, url), "get usage").await?;
        UsageStats::from_payload(&body)
            .ok_or_else(|| CoreError::Network("Usage response has no 'usage' object".to_string()))
    }

    async fn list_api_keys(&self) -> CoreResult<Vec<String>> {
        let url = self.endpoint("api-keys")?;
        let body = self.send_json(self.request(Method::GET, url), "list API keys").await?;
        serde_json::from_value(unwrap_list(body, "api-keys"))
            .map_err(|e| CoreError::Network(format!("Failed to parse API keys: {}", e)))
    }

    async fn add_api_key(&self, key: &str) -> CoreResult<()> {
        let mut keys = self.list_api_keys().await?;
        if keys.iter().any(|k| k == key) {
            return Ok(());
        }
        keys.push(key.to_string());
        self.put_api_keys(&keys).await
    }

    async fn update_api_key(&self, old: &str, new: &str) -> CoreResult<()> {
        let url = self.endpoint("api-keys")?;
        let body = json!({ "old": old, "new": new });
        self.send(self.request(Method::PATCH, url).json(&body), "update API key")
            .await?;
        Ok(())
    }

    async fn delete_api_key(&self, key: &str) -> CoreResult<()> {
        let mut url = self.endpoint("api-keys")?;
        url.query_pairs_mut().append_pair("value", key);
        self.send(self.request(Method::DELETE, url), "delete API key").await?;
        Ok(())
    }

    async fn fetch_logs(&self, after: Option<i64>) -> CoreResult<LogBatch> {
        let mut url = self.endpoint("logs")?;
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", &after.to_string());
        }
        let response = self.send(self.request(Method::GET, url), "get logs").await?;
        let body: LogsResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Network(format!("Failed to parse logs response: {}", e)))?;

        Ok(LogBatch {
            entries: parse_lines(&body.lines),
            latest_timestamp: body.latest_timestamp,
        })
    }

    async fn clear_logs(&self) -> CoreResult<()> {
        let url = self.endpoint("logs")?;
        self.send(self.request(Method::DELETE, url), "clear logs").await?;
        Ok(())
    }

    async fn request_oauth_url(&self, provider: AIProvider, project_id: Option<&str>) -> CoreResult<OAuthStart> {
        let endpoint = provider.auth_url_endpoint().ok_or_else(|| {
            CoreError::Unsupported(format!("{} uses service account import, not OAuth", provider))
        })?;
        let mut url = self.endpoint(endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("is_webui", "true");
            if let Some(project_id) = project_id.filter(|p| !p.is_empty()) {
                query.append_pair("project_id", project_id);
            }
        }

        let body = self.send_json(self.request(Method::GET, url), "get OAuth URL").await?;
        if body["status"].as_str() == Some("error") {
            let message = body["error"].as_str().unwrap_or("OAuth request rejected");
            return Err(CoreError::Network(message.to_string()));
        }
        let oauth_url = body["url"]
            .as_str()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::Network("No URL in OAuth response".to_string()))?;

        Ok(OAuthStart {
            url: oauth_url.to_string(),
            state: body["state"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn poll_oauth_status(&self, state: &str) -> CoreResult<OAuthPollStatus> {
        let mut url = self.endpoint("get-auth-status")?;
        url.query_pairs_mut().append_pair("state", state);
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("Failed to poll OAuth status: {}", e)))?;

        // Not ready yet
        if !response.status().is_success() {
            return Ok(OAuthPollStatus::Pending(response.status().to_string()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Network(format!("Failed to parse OAuth status: {}", e)))?;
        Ok(OAuthPollStatus::from_payload(&body))
    }

    async fn put_setting(&self, path: &str, value: Value) -> CoreResult<()> {
        let url = self.endpoint(path)?;
        let body = json!({ "value": value });
        self.send(self.request(Method::PUT, url).json(&body), &format!("update {}", path))
            .await?;
        Ok(())
    }
}
