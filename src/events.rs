//! Observable events and the narrow interfaces to OS-level collaborators.
//!
//! Presentation layers subscribe to [`EventBus`] for state changes and read
//! snapshots from the owning component. OS notifications and the browser are
//! reached only through [`StatusChangeNotifier`] and [`BrowserOpener`].

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::error::CoreResult;
use crate::installer::InstallationState;
use crate::oauth::OAuthState;
use crate::proxy::ProxyStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    ProxyStatusChanged(ProxyStatus),
    InstallProgress(InstallationState),
    RefreshUpdated,
    QuotaUpdated,
    RefreshFailed(String),
    OAuthStateChanged(OAuthState),
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::ProxyStatusChanged(_) => "proxy-status-changed",
            CoreEvent::InstallProgress(_) => "install-progress",
            CoreEvent::RefreshUpdated => "auth-status-changed",
            CoreEvent::QuotaUpdated => "quota-updated",
            CoreEvent::RefreshFailed(_) => "refresh-failed",
            CoreEvent::OAuthStateChanged(_) => "oauth-state-changed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire and forget; having no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        log::trace!("[events] {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Transition events handed to the OS notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NotificationEvent {
    ProxyCrashed { exit_code: i32 },
    AccountCooling { provider: String, account: String },
    AccountCoolingCleared { provider: String, account: String },
    QuotaLow { provider: String, account: String, percentage: f64 },
    QuotaLowCleared { provider: String, account: String },
}

pub trait StatusChangeNotifier: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

pub trait BrowserOpener: Send + Sync {
    fn open_url(&self, url: &str) -> CoreResult<()>;
}

/// Notifier that drops everything, for hosts without notification support.
pub struct NoopNotifier;

impl StatusChangeNotifier for NoopNotifier {
    fn notify(&self, _event: NotificationEvent) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    pub enabled: bool,
    pub notify_on_cooling: bool,
    pub notify_on_quota_low: bool,
    pub notify_on_crash: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_on_cooling: true,
            notify_on_quota_low: true,
            notify_on_crash: true,
        }
    }
}

impl NotificationPreferences {
    pub fn allows(&self, event: &NotificationEvent) -> bool {
        if !self.enabled {
            return false;
        }
        match event {
            NotificationEvent::ProxyCrashed { .. } => self.notify_on_crash,
            NotificationEvent::AccountCooling { .. }
            | NotificationEvent::AccountCoolingCleared { .. } => self.notify_on_cooling,
            NotificationEvent::QuotaLow { .. } | NotificationEvent::QuotaLowCleared { .. } => {
                self.notify_on_quota_low
            }
        }
    }
}

/// Wraps a notifier and drops events the user opted out of.
pub struct PreferenceFilter {
    inner: Arc<dyn StatusChangeNotifier>,
    prefs: RwLock<NotificationPreferences>,
}

impl PreferenceFilter {
    pub fn new(inner: Arc<dyn StatusChangeNotifier>, prefs: NotificationPreferences) -> Self {
        Self {
            inner,
            prefs: RwLock::new(prefs),
        }
    }

    pub fn set_preferences(&self, prefs: NotificationPreferences) {
        if let Ok(mut current) = self.prefs.write() {
            *current = prefs;
        }
    }
}

impl StatusChangeNotifier for PreferenceFilter {
    fn notify(&self, event: NotificationEvent) {
        let allowed = self
            .prefs
            .read()
            .map(|prefs| prefs.allows(&event))
            .unwrap_or(true);
        if allowed {
            self.inner.notify(event);
        } else {
            log::debug!("[events] notification suppressed by preferences: {:?}", event);
        }
    }
}
