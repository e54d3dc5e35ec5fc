//! Wires installer, supervisor, scheduler and OAuth controller together.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::CoreResult;
use crate::events::{
    BrowserOpener, EventBus, NotificationPreferences, PreferenceFilter, StatusChangeNotifier,
};
use crate::installer::ReleaseInstaller;
use crate::management::{apply_runtime_settings, HttpManagementClient, ManagementClient};
use crate::oauth::AuthorizationFlowController;
use crate::proxy::{ConfigSynchronizer, ProcessSupervisor, ProxyDefaults, ProxyStatus, SupervisorOptions};
use crate::refresh::{QuotaSource, RefreshScheduler, RefreshTrigger};
use crate::settings::{CoreSettings, Paths, RuntimeConfig, SettingsStore};

/// Host-provided implementations of the OS-facing seams.
pub struct Collaborators {
    pub notifier: Arc<dyn StatusChangeNotifier>,
    pub opener: Arc<dyn BrowserOpener>,
    pub quota_sources: Vec<Arc<dyn QuotaSource>>,
}

pub struct ProxyManager {
    paths: Paths,
    runtime: RuntimeConfig,
    store: Arc<dyn SettingsStore>,
    settings: RwLock<CoreSettings>,
    notifier: Arc<PreferenceFilter>,
    events: EventBus,
    installer: ReleaseInstaller,
    supervisor: ProcessSupervisor,
    scheduler: RefreshScheduler,
    oauth: Arc<AuthorizationFlowController>,
    // Held across start/stop and while the watcher reacts to an exit.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

fn proxy_defaults(settings: &CoreSettings) -> ProxyDefaults {
    ProxyDefaults {
        request_retry: settings.request_retry,
        quota_switch_project: settings.quota_switch_project,
        quota_switch_preview_model: settings.quota_switch_preview_model,
        routing_strategy: settings.routing_strategy.clone(),
    }
}

impl ProxyManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        paths: Paths,
        store: Arc<dyn SettingsStore>,
        runtime: RuntimeConfig,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        let settings = CoreSettings::load(store.as_ref())?;
        let events = EventBus::default();
        let notifier = Arc::new(PreferenceFilter::new(
            collaborators.notifier,
            settings.notifications.clone(),
        ));

        let installer = ReleaseInstaller::new(paths.binary_path.clone(), &runtime, events.clone())?;
        let config = ConfigSynchronizer::new(paths.config_path.clone()).with_defaults(proxy_defaults(&settings));
        let supervisor = ProcessSupervisor::new(
            SupervisorOptions {
                binary_path: paths.binary_path.clone(),
                auth_dir: paths.auth_dir.clone(),
                port: settings.port,
                secret_key: settings.management_key.clone(),
                startup_grace: runtime.startup_grace,
                stop_timeout: runtime.stop_timeout,
            },
            config,
            notifier.clone(),
            events.clone(),
        );

        let scheduler = RefreshScheduler::new(
            &runtime,
            collaborators.quota_sources,
            notifier.clone(),
            events.clone(),
        );
        scheduler.set_quota_alert_threshold(settings.quota_alert_threshold);

        let oauth = Arc::new(AuthorizationFlowController::new(
            &runtime,
            collaborators.opener,
            events.clone(),
        ));
        oauth.set_refresh_trigger(Arc::new(scheduler.clone()) as Arc<dyn RefreshTrigger>);

        let manager = Self {
            paths,
            runtime,
            store,
            settings: RwLock::new(settings),
            notifier,
            events,
            installer,
            supervisor,
            scheduler,
            oauth,
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            watcher: Mutex::new(None),
        };
        manager.watch_process();
        Ok(manager)
    }

    /// Tears polling down whenever the process stops, including crashes.
    fn watch_process(&self) {
        let mut status = self.supervisor.subscribe();
        let supervisor = self.supervisor.clone();
        let scheduler = self.scheduler.clone();
        let oauth = self.oauth.clone();
        let lifecycle = self.lifecycle.clone();
        let task = tokio::spawn(async move {
            let mut was_running = status.borrow().running;
            while status.changed().await.is_ok() {
                let running = status.borrow_and_update().running;
                if was_running && !running {
                    let _lifecycle = lifecycle.lock().await;
                    // A restart may have raced ahead of us.
                    if !supervisor.is_running() {
                        log::info!("[manager] Proxy stopped, halting refresh");
                        scheduler.stop();
                        scheduler.unbind();
                        oauth.unbind();
                    }
                }
                was_running = running;
            }
        });
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(task);
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn installer(&self) -> &ReleaseInstaller {
        &self.installer
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn oauth(&self) -> &AuthorizationFlowController {
        &self.oauth
    }

    pub fn settings(&self) -> CoreSettings {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> ProxyStatus {
        self.supervisor.status()
    }

    pub async fn ensure_installed(&self) -> CoreResult<PathBuf> {
        if self.installer.is_installed() {
            return Ok(self.installer.target().to_path_buf());
        }
        log::info!("[manager] CLIProxyAPI not installed, downloading latest release");
        self.installer.install().await
    }

    /// Installs if needed, starts the proxy, then binds management polling
    /// to it.
    pub async fn start(&self) -> CoreResult<ProxyStatus> {
        self.ensure_installed().await?;
        let _lifecycle = self.lifecycle.lock().await;
        let status = self.supervisor.start().await?;

        let client: Arc<dyn ManagementClient> = Arc::new(HttpManagementClient::new(
            status.port,
            self.supervisor.secret_key(),
            self.runtime.management_timeout,
        )?);
        self.scheduler.bind(client.clone());
        self.oauth.bind(client.clone());

        let defaults = proxy_defaults(&self.settings());
        tokio::spawn(async move {
            let applied = apply_runtime_settings(client.as_ref(), &defaults).await;
            log::debug!("[manager] Applied {} runtime settings", applied);
        });

        self.scheduler.start();
        Ok(status)
    }

    pub async fn stop(&self) -> CoreResult<ProxyStatus> {
        let _lifecycle = self.lifecycle.lock().await;
        self.scheduler.stop();
        self.scheduler.unbind();
        self.oauth.unbind();
        self.supervisor.stop().await
    }

    pub async fn restart(&self) -> CoreResult<ProxyStatus> {
        self.stop().await?;
        self.start().await
    }

    /// Persists the port and rewrites the config. Takes effect on the next
    /// start.
    pub fn set_port(&self, port: u16) -> CoreResult<()> {
        self.update_settings(|s| s.port = port)?;
        self.supervisor.set_port(port)
    }

    /// Replaces the management key in settings and in the config file.
    pub fn rotate_management_key(&self) -> CoreResult<String> {
        let key = crate::settings::generate_management_key();
        self.update_settings(|s| s.management_key = key.clone())?;
        self.supervisor.set_secret_key(&key)?;
        Ok(key)
    }

    pub fn set_notification_preferences(&self, prefs: NotificationPreferences) -> CoreResult<()> {
        self.update_settings(|s| s.notifications = prefs.clone())?;
        self.notifier.set_preferences(prefs);
        Ok(())
    }

    pub fn set_quota_alert_threshold(&self, threshold: f64) -> CoreResult<()> {
        let threshold = threshold.clamp(0.0, 100.0);
        self.update_settings(|s| s.quota_alert_threshold = threshold)?;
        self.scheduler.set_quota_alert_threshold(threshold);
        Ok(())
    }

    fn update_settings(&self, f: impl FnOnce(&mut CoreSettings)) -> CoreResult<()> {
        let updated = {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            f(&mut settings);
            settings.clone()
        };
        updated.save(self.store.as_ref())
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        self.scheduler.stop();
        if let Some(task) = self.watcher.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
    }
}
