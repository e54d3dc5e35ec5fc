use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CoreResult;
use crate::events::NotificationPreferences;

pub const DEFAULT_PORT: u16 = 8317;
pub const DEFAULT_QUOTA_ALERT_THRESHOLD: f64 = 20.0;

#[cfg(windows)]
pub const BINARY_NAME: &str = "cli-proxy-api.exe";
#[cfg(not(windows))]
pub const BINARY_NAME: &str = "cli-proxy-api";

/// Filesystem locations used by the core.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub binary_path: PathBuf,
    pub settings_path: PathBuf,
    pub auth_dir: PathBuf,
}

impl Paths {
    /// `<config dir>/proxypal` with the proxy's auth dir in `~/.cli-proxy-api`.
    pub fn default_locations() -> Self {
        let base_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("proxypal");
        let auth_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cli-proxy-api");
        Self::with_auth_dir(base_dir, auth_dir)
    }

    /// Everything below `root`; used by tests and portable installs.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let auth_dir = root.join("auth");
        Self::with_auth_dir(root, auth_dir)
    }

    fn with_auth_dir(base_dir: PathBuf, auth_dir: PathBuf) -> Self {
        Self {
            config_path: base_dir.join("proxy-config.yaml"),
            binary_path: base_dir.join("bin").join(BINARY_NAME),
            settings_path: base_dir.join("settings.json"),
            base_dir,
            auth_dir,
        }
    }
}

/// Plain key/value access to the host's preference storage.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<serde_json::Map<String, Value>>,
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> CoreResult<()> {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}

/// Settings persisted as a flat pretty-printed JSON object.
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, Value>>,
}

impl JsonFileSettings {
    /// Unreadable or malformed files start from empty settings.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str::<serde_json::Map<String, Value>>(&data).ok())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn save(&self, values: &serde_json::Map<String, Value>) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(values)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> CoreResult<()> {
        let snapshot = match self.values.lock() {
            Ok(mut values) => {
                values.insert(key.to_string(), value);
                values.clone()
            }
            Err(_) => return Ok(()),
        };
        self.save(&snapshot)
    }
}

pub mod keys {
    pub const PORT: &str = "port";
    pub const MANAGEMENT_KEY: &str = "managementKey";
    pub const ROUTING_STRATEGY: &str = "routingStrategy";
    pub const REQUEST_RETRY: &str = "requestRetry";
    pub const QUOTA_SWITCH_PROJECT: &str = "quotaSwitchProject";
    pub const QUOTA_SWITCH_PREVIEW_MODEL: &str = "quotaSwitchPreviewModel";
    pub const NOTIFICATIONS_ENABLED: &str = "notificationsEnabled";
    pub const NOTIFY_ON_COOLING: &str = "notifyOnCooling";
    pub const NOTIFY_ON_QUOTA_LOW: &str = "notifyOnQuotaLow";
    pub const NOTIFY_ON_CRASH: &str = "notifyOnCrash";
    pub const QUOTA_ALERT_THRESHOLD: &str = "quotaAlertThreshold";
}

/// Typed view over the scalar settings this core consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreSettings {
    pub port: u16,
    pub management_key: String,
    pub routing_strategy: String,
    pub request_retry: u16,
    pub quota_switch_project: bool,
    pub quota_switch_preview_model: bool,
    pub notifications: NotificationPreferences,
    pub quota_alert_threshold: f64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            management_key: generate_management_key(),
            routing_strategy: "round-robin".to_string(),
            request_retry: 3,
            quota_switch_project: false,
            quota_switch_preview_model: false,
            notifications: NotificationPreferences::default(),
            quota_alert_threshold: DEFAULT_QUOTA_ALERT_THRESHOLD,
        }
    }
}

impl CoreSettings {
    /// Reads every field, falling back to defaults. A management key is
    /// generated and written back the first time so it stays stable.
    pub fn load(store: &dyn SettingsStore) -> CoreResult<Self> {
        let defaults = Self::default();
        let management_key = match get_string(store, keys::MANAGEMENT_KEY) {
            Some(key) if !key.is_empty() => key,
            _ => {
                store.set(keys::MANAGEMENT_KEY, Value::from(defaults.management_key.clone()))?;
                defaults.management_key.clone()
            }
        };

        let port = store
            .get(keys::PORT)
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .filter(|p| *p != 0)
            .unwrap_or(defaults.port);

        Ok(Self {
            port,
            management_key,
            routing_strategy: get_string(store, keys::ROUTING_STRATEGY)
                .unwrap_or(defaults.routing_strategy),
            request_retry: store
                .get(keys::REQUEST_RETRY)
                .and_then(|v| v.as_u64())
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(defaults.request_retry),
            quota_switch_project: get_bool(store, keys::QUOTA_SWITCH_PROJECT)
                .unwrap_or(defaults.quota_switch_project),
            quota_switch_preview_model: get_bool(store, keys::QUOTA_SWITCH_PREVIEW_MODEL)
                .unwrap_or(defaults.quota_switch_preview_model),
            notifications: NotificationPreferences {
                enabled: get_bool(store, keys::NOTIFICATIONS_ENABLED)
                    .unwrap_or(defaults.notifications.enabled),
                notify_on_cooling: get_bool(store, keys::NOTIFY_ON_COOLING)
                    .unwrap_or(defaults.notifications.notify_on_cooling),
                notify_on_quota_low: get_bool(store, keys::NOTIFY_ON_QUOTA_LOW)
                    .unwrap_or(defaults.notifications.notify_on_quota_low),
                notify_on_crash: get_bool(store, keys::NOTIFY_ON_CRASH)
                    .unwrap_or(defaults.notifications.notify_on_crash),
            },
            quota_alert_threshold: store
                .get(keys::QUOTA_ALERT_THRESHOLD)
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.quota_alert_threshold),
        })
    }

    pub fn save(&self, store: &dyn SettingsStore) -> CoreResult<()> {
        store.set(keys::PORT, Value::from(self.port))?;
        store.set(keys::MANAGEMENT_KEY, Value::from(self.management_key.clone()))?;
        store.set(keys::ROUTING_STRATEGY, Value::from(self.routing_strategy.clone()))?;
        store.set(keys::REQUEST_RETRY, Value::from(self.request_retry))?;
        store.set(keys::QUOTA_SWITCH_PROJECT, Value::from(self.quota_switch_project))?;
        store.set(
            keys::QUOTA_SWITCH_PREVIEW_MODEL,
            Value::from(self.quota_switch_preview_model),
        )?;
        store.set(keys::NOTIFICATIONS_ENABLED, Value::from(self.notifications.enabled))?;
        store.set(keys::NOTIFY_ON_COOLING, Value::from(self.notifications.notify_on_cooling))?;
        store.set(
            keys::NOTIFY_ON_QUOTA_LOW,
            Value::from(self.notifications.notify_on_quota_low),
        )?;
        store.set(keys::NOTIFY_ON_CRASH, Value::from(self.notifications.notify_on_crash))?;
        store.set(keys::QUOTA_ALERT_THRESHOLD, Value::from(self.quota_alert_threshold))?;
        Ok(())
    }
}

fn get_string(store: &dyn SettingsStore, key: &str) -> Option<String> {
    store.get(key).and_then(|v| v.as_str().map(str::to_string))
}

fn get_bool(store: &dyn SettingsStore, key: &str) -> Option<bool> {
    store.get(key).and_then(|v| v.as_bool())
}

pub fn generate_management_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Cadences and timeouts. None of these are persisted.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub fast_refresh_interval: Duration,
    pub quota_refresh_interval: Duration,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
    pub oauth_poll_interval: Duration,
    pub oauth_max_attempts: u32,
    pub management_timeout: Duration,
    pub manifest_timeout: Duration,
    pub download_connect_timeout: Duration,
    pub release_manifest_url: String,
}

pub const MIN_QUOTA_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fast_refresh_interval: Duration::from_secs(5),
            quota_refresh_interval: Duration::from_secs(60),
            startup_grace: Duration::from_millis(1500),
            stop_timeout: Duration::from_secs(5),
            oauth_poll_interval: Duration::from_secs(2),
            oauth_max_attempts: 60,
            management_timeout: Duration::from_secs(10),
            manifest_timeout: Duration::from_secs(30),
            download_connect_timeout: Duration::from_secs(30),
            release_manifest_url:
                "https://api.github.com/repos/router-for-me/CLIProxyAPI/releases/latest".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Quota cadence after clamping: at least a minute and strictly longer
    /// than the fast cadence.
    pub fn effective_quota_interval(&self) -> Duration {
        let floor = MIN_QUOTA_REFRESH_INTERVAL.max(self.fast_refresh_interval + Duration::from_secs(1));
        self.quota_refresh_interval.max(floor)
    }
}
