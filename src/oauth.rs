//! Provider authorization through the proxy's OAuth endpoints.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{CoreError, CoreResult};
use crate::events::{BrowserOpener, CoreEvent, EventBus};
use crate::management::{AIProvider, ManagementClient, OAuthPollStatus};
use crate::refresh::RefreshTrigger;
use crate::settings::RuntimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStatus {
    Waiting,
    Polling,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthState {
    pub provider: AIProvider,
    pub status: OAuthStatus,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl OAuthState {
    fn new(provider: AIProvider, status: OAuthStatus) -> Self {
        Self {
            provider,
            status,
            state: None,
            error: None,
        }
    }

    fn failed(provider: AIProvider, state: Option<String>, error: impl Into<String>) -> Self {
        Self {
            provider,
            status: OAuthStatus::Error,
            state,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthOutcome {
    Authorized,
    /// A newer flow started before this one finished.
    Superseded,
}

pub struct AuthorizationFlowController {
    client: RwLock<Option<Arc<dyn ManagementClient>>>,
    refresher: RwLock<Option<Arc<dyn RefreshTrigger>>>,
    opener: Arc<dyn BrowserOpener>,
    state: watch::Sender<Option<OAuthState>>,
    generation: AtomicU64,
    poll_interval: Duration,
    max_attempts: u32,
    events: EventBus,
}

impl AuthorizationFlowController {
    pub fn new(config: &RuntimeConfig, opener: Arc<dyn BrowserOpener>, events: EventBus) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            client: RwLock::new(None),
            refresher: RwLock::new(None),
            opener,
            state,
            generation: AtomicU64::new(0),
            poll_interval: config.oauth_poll_interval,
            max_attempts: config.oauth_max_attempts.max(1),
            events,
        }
    }

    pub fn bind(&self, client: Arc<dyn ManagementClient>) {
        if let Ok(mut slot) = self.client.write() {
            *slot = Some(client);
        }
    }

    pub fn unbind(&self) {
        if let Ok(mut slot) = self.client.write() {
            *slot = None;
        }
    }

    /// Called after a successful authorization or credential import.
    pub fn set_refresh_trigger(&self, trigger: Arc<dyn RefreshTrigger>) {
        if let Ok(mut slot) = self.refresher.write() {
            *slot = Some(trigger);
        }
    }

    pub fn current(&self) -> Option<OAuthState> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<OAuthState>> {
        self.state.subscribe()
    }

    /// Abandons any flow in progress. Its poll loop exits at the next
    /// attempt boundary without publishing.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(None);
    }

    fn client(&self) -> Option<Arc<dyn ManagementClient>> {
        self.client.read().ok().and_then(|c| c.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish(&self, generation: u64, state: OAuthState) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        log::debug!("[oauth] {} -> {:?}", state.provider, state.status);
        self.state.send_replace(Some(state.clone()));
        self.events.emit(CoreEvent::OAuthStateChanged(state));
        true
    }

    async fn refresh_after_change(&self) {
        let trigger = self.refresher.read().ok().and_then(|r| r.clone());
        if let Some(trigger) = trigger {
            trigger.trigger_refresh().await;
        }
    }

    /// Runs one authorization flow: fetch the provider URL, open it in the
    /// browser, then poll until the proxy reports success, an error, or
    /// the attempts run out.
    pub async fn authorize(&self, provider: AIProvider, project_id: Option<&str>) -> CoreResult<OAuthOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(generation, OAuthState::new(provider, OAuthStatus::Waiting));

        if provider.auth_url_endpoint().is_none() {
            let err = CoreError::Unsupported(format!(
                "{} uses service account import, not OAuth",
                provider
            ));
            self.publish(generation, OAuthState::failed(provider, None, err.to_string()));
            return Err(err);
        }

        let Some(client) = self.client() else {
            let err = CoreError::ProxyUnavailable;
            self.publish(generation, OAuthState::failed(provider, None, err.user_message()));
            return Err(err);
        };

        let start = match client.request_oauth_url(provider, project_id).await {
            Ok(start) => start,
            Err(e) => {
                log::warn!("[oauth] Failed to get {} auth URL: {}", provider, e);
                self.publish(generation, OAuthState::failed(provider, None, e.to_string()));
                return Err(e);
            }
        };
        let oauth_state = Some(start.state.clone());

        if let Err(e) = self.opener.open_url(&start.url) {
            self.publish(generation, OAuthState::failed(provider, oauth_state, e.to_string()));
            return Err(e);
        }
        log::info!("[oauth] Opened {} authorization in browser", provider);

        self.publish(
            generation,
            OAuthState {
                provider,
                status: OAuthStatus::Polling,
                state: oauth_state.clone(),
                error: None,
            },
        );

        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.poll_interval).await;
            if !self.is_current(generation) {
                log::debug!("[oauth] {} flow superseded", provider);
                return Ok(OAuthOutcome::Superseded);
            }

            let Some(client) = self.client() else {
                let err = CoreError::ProxyUnavailable;
                self.publish(
                    generation,
                    OAuthState::failed(provider, oauth_state, err.user_message()),
                );
                return Err(err);
            };

            match client.poll_oauth_status(&start.state).await {
                Ok(OAuthPollStatus::Ok) => {
                    if !self.publish(
                        generation,
                        OAuthState {
                            provider,
                            status: OAuthStatus::Success,
                            state: oauth_state,
                            error: None,
                        },
                    ) {
                        return Ok(OAuthOutcome::Superseded);
                    }
                    log::info!("[oauth] {} authorized after {} polls", provider, attempt);
                    self.refresh_after_change().await;
                    return Ok(OAuthOutcome::Authorized);
                }
                Ok(OAuthPollStatus::Error(message)) => {
                    log::warn!("[oauth] {} authorization failed: {}", provider, message);
                    self.publish(
                        generation,
                        OAuthState::failed(provider, oauth_state, message.clone()),
                    );
                    return Err(CoreError::AuthorizationFailed(message));
                }
                Ok(OAuthPollStatus::Pending(_)) => {}
                Err(e) => log::debug!("[oauth] Poll {} failed: {}", attempt, e),
            }
        }

        let message = format!(
            "Authorization timed out after {} attempts",
            self.max_attempts
        );
        self.publish(generation, OAuthState::failed(provider, oauth_state, message.clone()));
        Err(CoreError::Timeout(message))
    }

    /// Validates a Vertex service-account key and uploads it to the proxy.
    /// Returns the key's project id.
    pub async fn import_vertex_credential(&self, path: &Path) -> CoreResult<String> {
        let content = tokio::fs::read(path).await?;
        let json: serde_json::Value = serde_json::from_slice(&content)
            .map_err(|e| CoreError::InvalidCredential(format!("Invalid JSON: {}", e)))?;

        if json["type"].as_str() != Some("service_account") {
            return Err(CoreError::InvalidCredential(
                "'type' must be 'service_account'".to_string(),
            ));
        }
        let project_id = json["project_id"]
            .as_str()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| CoreError::InvalidCredential("missing 'project_id'".to_string()))?
            .to_string();

        let client = self.client().ok_or(CoreError::ProxyUnavailable)?;
        let file_name = format!("vertex-{}.json", project_id);
        client
            .upload_auth_file(AIProvider::Vertex, &file_name, content)
            .await?;
        log::info!("[oauth] Imported Vertex credential for project {}", project_id);

        self.refresh_after_change().await;
        Ok(project_id)
    }
}
