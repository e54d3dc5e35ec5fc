use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::logs::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AIProvider {
    Claude,
    Codex,
    Gemini,
    Qwen,
    #[serde(rename = "iflow")]
    IFlow,
    Antigravity,
    Vertex,
}

impl AIProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AIProvider::Claude => "claude",
            AIProvider::Codex => "codex",
            AIProvider::Gemini => "gemini",
            AIProvider::Qwen => "qwen",
            AIProvider::IFlow => "iflow",
            AIProvider::Antigravity => "antigravity",
            AIProvider::Vertex => "vertex",
        }
    }

    /// Management endpoint that hands out the provider's OAuth URL. Vertex
    /// uses service-account import instead.
    pub fn auth_url_endpoint(&self) -> Option<&'static str> {
        match self {
            AIProvider::Claude => Some("anthropic-auth-url"),
            AIProvider::Codex => Some("codex-auth-url"),
            AIProvider::Gemini => Some("gemini-cli-auth-url"),
            AIProvider::Qwen => Some("qwen-auth-url"),
            AIProvider::IFlow => Some("iflow-auth-url"),
            AIProvider::Antigravity => Some("antigravity-auth-url"),
            AIProvider::Vertex => None,
        }
    }
}

impl fmt::Display for AIProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AIProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "anthropic" => Ok(AIProvider::Claude),
            "codex" | "openai" => Ok(AIProvider::Codex),
            "gemini" | "gemini-cli" => Ok(AIProvider::Gemini),
            "qwen" => Ok(AIProvider::Qwen),
            "iflow" => Ok(AIProvider::IFlow),
            "antigravity" => Ok(AIProvider::Antigravity),
            "vertex" => Ok(AIProvider::Vertex),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccountStatus {
    Ready,
    Cooling,
    Error,
    Disabled,
    Unknown(String),
}

impl AccountStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "ready" | "active" => AccountStatus::Ready,
            "cooling" | "cooldown" => AccountStatus::Cooling,
            "error" => AccountStatus::Error,
            "disabled" => AccountStatus::Disabled,
            other => AccountStatus::Unknown(other.to_string()),
        }
    }
}

// Auth file entry from Management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, alias = "type")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<String>,
}

impl AuthFile {
    pub fn account_status(&self) -> AccountStatus {
        AccountStatus::parse(&self.status)
    }

    pub fn account_label(&self) -> &str {
        self.email.as_deref().filter(|e| !e.is_empty()).unwrap_or(&self.name)
    }

    /// Stable identity for status tracking: `{provider}_{email or file name}`.
    pub fn account_key(&self) -> String {
        format!("{}_{}", self.provider, self.account_label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub models: Vec<ModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub model: String,
    pub requests: u64,
    pub tokens: u64,
}

impl UsageStats {
    /// Structure: `{ "usage": { "total_tokens": N, "apis": { "POST /v1/messages":
    /// { "models": { name: { "details": [ { "tokens": {...} } ] } } } } } }`
    pub fn from_payload(body: &Value) -> Option<Self> {
        let usage = body.get("usage")?;
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);

        let mut stats = UsageStats {
            total_requests: field("total_requests"),
            success_count: field("success_count"),
            failure_count: field("failure_count"),
            total_tokens: field("total_tokens"),
            ..Default::default()
        };

        // (requests, tokens)
        let mut per_model: HashMap<String, (u64, u64)> = HashMap::new();
        if let Some(apis) = usage.get("apis").and_then(|v| v.as_object()) {
            for api_data in apis.values() {
                let Some(models) = api_data.get("models").and_then(|v| v.as_object()) else {
                    continue;
                };
                for (model_name, model_data) in models {
                    let details = model_data.get("details").and_then(|v| v.as_array());
                    for detail in details.into_iter().flatten() {
                        let Some(tokens) = detail.get("tokens") else {
                            continue;
                        };
                        let input = tokens.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                        let output = tokens.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                        stats.input_tokens += input;
                        stats.output_tokens += output;
                        let entry = per_model.entry(model_name.clone()).or_insert((0, 0));
                        entry.0 += 1;
                        entry.1 += input + output;
                    }
                }
            }
        }

        let mut models: Vec<ModelUsage> = per_model
            .into_iter()
            .map(|(model, (requests, tokens))| ModelUsage { model, requests, tokens })
            .collect();
        models.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.model.cmp(&b.model)));
        stats.models = models;
        Some(stats)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogBatch {
    pub entries: Vec<LogEntry>,
    pub latest_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OAuthStart {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OAuthPollStatus {
    Ok,
    Error(String),
    Pending(String),
}

impl OAuthPollStatus {
    /// CLIProxyAPI answers `{ "status": "ok" | "error" | "wait", "error"?: .. }`.
    pub fn from_payload(body: &Value) -> Self {
        match body.get("status").and_then(|v| v.as_str()).unwrap_or("wait") {
            "ok" => OAuthPollStatus::Ok,
            "error" => OAuthPollStatus::Error(
                body.get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Authorization failed")
                    .to_string(),
            ),
            other => OAuthPollStatus::Pending(other.to_string()),
        }
    }
}
