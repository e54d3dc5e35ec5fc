//! Periodic polling of a running proxy's management API.
//!
//! A fast tick (auth files, usage, API keys, logs) runs on a fixed cadence.
//! From inside it, a slower quota pass is started on its own task whenever
//! the quota cadence has elapsed and no pass is already in flight, so a slow
//! quota backend can never hold up the fast tick.

pub mod quota;
pub mod transitions;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{CoreEvent, EventBus, StatusChangeNotifier};
use crate::management::{AuthFile, LogEntry, ManagementClient, UsageStats};
use crate::settings::{RuntimeConfig, DEFAULT_QUOTA_ALERT_THRESHOLD};

pub use quota::{CategoryQuota, ModelQuota, ProviderQuotaData, QuotaCategory, QuotaSource};
pub use transitions::{QuotaAlertTracker, StatusTracker};

pub const MAX_LOG_ENTRIES: usize = 500;

/// Something that can be asked to refresh everything right away.
#[async_trait]
pub trait RefreshTrigger: Send + Sync {
    async fn trigger_refresh(&self);
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSnapshot {
    pub auth_files: Vec<AuthFile>,
    pub usage: Option<UsageStats>,
    pub api_keys: Vec<String>,
    pub logs: VecDeque<LogEntry>,
    pub quotas: HashMap<QuotaCategory, CategoryQuota>,
    /// Fast-tick failures; cleared by the next fully successful tick.
    pub last_error: Option<String>,
    /// Quota-pass failures, tracked apart from `last_error`.
    pub quota_error: Option<String>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub last_quota_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRefreshOutcome {
    Completed { succeeded: usize, failed: usize },
    AlreadyRunning,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    fast_interval: Duration,
    quota_interval: Duration,
    client: RwLock<Option<Arc<dyn ManagementClient>>>,
    sources: Vec<Arc<dyn QuotaSource>>,
    snapshot: watch::Sender<RefreshSnapshot>,
    status_tracker: Mutex<StatusTracker>,
    quota_alerts: Mutex<QuotaAlertTracker>,
    quota_threshold: Mutex<f64>,
    quota_in_flight: AtomicBool,
    last_quota_started: Mutex<Option<Instant>>,
    quota_tasks: Mutex<Vec<JoinHandle<()>>>,
    log_cursor: Mutex<Option<i64>>,
    cancel: Mutex<Option<CancellationToken>>,
    notifier: Arc<dyn StatusChangeNotifier>,
    events: EventBus,
}

/// Clears the in-flight flag however the quota pass ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshScheduler {
    pub fn new(
        config: &RuntimeConfig,
        sources: Vec<Arc<dyn QuotaSource>>,
        notifier: Arc<dyn StatusChangeNotifier>,
        events: EventBus,
    ) -> Self {
        let (snapshot, _) = watch::channel(RefreshSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                fast_interval: config.fast_refresh_interval,
                quota_interval: config.effective_quota_interval(),
                client: RwLock::new(None),
                sources,
                snapshot,
                status_tracker: Mutex::new(StatusTracker::new()),
                quota_alerts: Mutex::new(QuotaAlertTracker::new()),
                quota_threshold: Mutex::new(DEFAULT_QUOTA_ALERT_THRESHOLD),
                quota_in_flight: AtomicBool::new(false),
                last_quota_started: Mutex::new(None),
                quota_tasks: Mutex::new(Vec::new()),
                log_cursor: Mutex::new(None),
                cancel: Mutex::new(None),
                notifier,
                events,
            }),
        }
    }

    pub fn bind(&self, client: Arc<dyn ManagementClient>) {
        if let Ok(mut slot) = self.inner.client.write() {
            *slot = Some(client);
        }
    }

    pub fn unbind(&self) {
        if let Ok(mut slot) = self.inner.client.write() {
            *slot = None;
        }
    }

    pub fn set_quota_alert_threshold(&self, threshold: f64) {
        if let Ok(mut current) = self.inner.quota_threshold.lock() {
            *current = threshold;
        }
    }

    pub fn quota_interval(&self) -> Duration {
        self.inner.quota_interval
    }

    pub fn snapshot(&self) -> RefreshSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .cancel
            .lock()
            .map(|c| c.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn is_quota_refresh_in_flight(&self) -> bool {
        self.inner.quota_in_flight.load(Ordering::Acquire)
    }

    /// Spawns the polling loop, cancelling any previous one. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.inner.cancel.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        log::info!(
            "[refresh] Scheduler started (fast={:?}, quota={:?})",
            self.inner.fast_interval,
            self.inner.quota_interval
        );
        tokio::spawn(run_loop(self.inner.clone(), token));
    }

    /// Cancels the loop and any detached quota pass, and forgets per-account
    /// history so the next start observes accounts afresh.
    pub fn stop(&self) {
        let token = self.inner.cancel.lock().ok().and_then(|mut slot| slot.take());
        if let Some(token) = token {
            token.cancel();
            log::info!("[refresh] Scheduler stopped");
        }
        if let Ok(mut tasks) = self.inner.quota_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut tracker) = self.inner.status_tracker.lock() {
            tracker.reset();
        }
        if let Ok(mut alerts) = self.inner.quota_alerts.lock() {
            alerts.reset();
        }
        if let Ok(mut cursor) = self.inner.log_cursor.lock() {
            *cursor = None;
        }
        if let Ok(mut last) = self.inner.last_quota_started.lock() {
            *last = None;
        }
    }

    /// One fast tick without the detached quota gate.
    pub async fn refresh_fast(&self) {
        self.inner.fast_tick().await;
    }

    /// One fast tick followed by a quota pass.
    pub async fn refresh_now(&self) -> QuotaRefreshOutcome {
        self.inner.fast_tick().await;
        self.inner.refresh_all_quotas().await
    }

    pub async fn refresh_all_quotas(&self) -> QuotaRefreshOutcome {
        self.inner.refresh_all_quotas().await
    }
}

#[async_trait]
impl RefreshTrigger for RefreshScheduler {
    /// Waits for the fast tick; the quota pass continues in the background.
    async fn trigger_refresh(&self) {
        self.inner.fast_tick().await;
        self.inner.spawn_quota_pass("Triggered");
    }
}

async fn run_loop(inner: Arc<Inner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.fast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = inner.fast_tick() => {}
        }
        inner.maybe_spawn_quota_refresh();
    }
    log::debug!("[refresh] Loop exited");
}

impl Inner {
    fn client(&self) -> Option<Arc<dyn ManagementClient>> {
        self.client.read().ok().and_then(|c| c.clone())
    }

    fn threshold(&self) -> f64 {
        self.quota_threshold
            .lock()
            .map(|t| *t)
            .unwrap_or(DEFAULT_QUOTA_ALERT_THRESHOLD)
    }

    async fn fast_tick(&self) {
        let Some(client) = self.client() else {
            log::debug!("[refresh] No management client bound, skipping tick");
            return;
        };

        let (files, usage, keys) = tokio::join!(
            client.list_auth_files(),
            client.usage_stats(),
            client.list_api_keys()
        );

        let mut errors = Vec::new();
        let mut notifications = Vec::new();
        let files = match files {
            Ok(files) => {
                if let Ok(mut tracker) = self.status_tracker.lock() {
                    notifications = tracker.observe(&files);
                }
                Some(files)
            }
            Err(e) => {
                errors.push(format!("auth files: {}", e));
                None
            }
        };
        let usage = usage.map_err(|e| errors.push(format!("usage: {}", e))).ok();
        let keys = keys.map_err(|e| errors.push(format!("api keys: {}", e))).ok();

        let last_error = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };

        self.snapshot.send_modify(|s| {
            if let Some(files) = files {
                s.auth_files = files;
            }
            if let Some(usage) = usage {
                s.usage = Some(usage);
            }
            if let Some(keys) = keys {
                s.api_keys = keys;
            }
            s.last_error = last_error.clone();
            s.last_refreshed = Some(Utc::now());
        });

        for event in notifications {
            self.notifier.notify(event);
        }

        self.fetch_logs(client.as_ref()).await;

        if let Some(message) = last_error {
            log::warn!("[refresh] Tick failed: {}", message);
            self.events.emit(CoreEvent::RefreshFailed(message));
        }
        self.events.emit(CoreEvent::RefreshUpdated);
    }

    async fn fetch_logs(&self, client: &dyn ManagementClient) {
        let after = self.log_cursor.lock().ok().and_then(|c| *c);
        let batch = match client.fetch_logs(after).await {
            Ok(batch) => batch,
            Err(e) => {
                log::debug!("[refresh] Log fetch failed: {}", e);
                return;
            }
        };

        if let Some(latest) = batch.latest_timestamp {
            if let Ok(mut cursor) = self.log_cursor.lock() {
                *cursor = Some(latest);
            }
        }
        if batch.entries.is_empty() {
            return;
        }
        self.snapshot.send_modify(|s| {
            s.logs.extend(batch.entries);
            while s.logs.len() > MAX_LOG_ENTRIES {
                s.logs.pop_front();
            }
        });
    }

    fn quota_due(&self) -> bool {
        self.last_quota_started
            .lock()
            .map(|last| last.map_or(true, |t| t.elapsed() >= self.quota_interval))
            .unwrap_or(false)
    }

    fn maybe_spawn_quota_refresh(self: &Arc<Self>) {
        if self.sources.is_empty() || self.quota_in_flight.load(Ordering::Acquire) || !self.quota_due() {
            return;
        }
        self.spawn_quota_pass("Scheduled");
    }

    /// Detached passes are tracked so `stop` can abort them.
    fn spawn_quota_pass(self: &Arc<Self>, origin: &'static str) {
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let outcome = inner.refresh_all_quotas().await;
            log::debug!("[refresh] {} quota pass: {:?}", origin, outcome);
        });
        if let Ok(mut tasks) = self.quota_tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    async fn refresh_all_quotas(&self) -> QuotaRefreshOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.quota_in_flight) else {
            log::debug!("[refresh] Quota refresh already in flight");
            return QuotaRefreshOutcome::AlreadyRunning;
        };
        if let Ok(mut last) = self.last_quota_started.lock() {
            *last = Some(Instant::now());
        }

        let results = futures_util::future::join_all(self.sources.iter().map(|source| async move {
            (source.category(), source.fetch().await)
        }))
        .await;

        let mut succeeded = 0;
        let mut failures = Vec::new();
        let mut quotas = HashMap::new();
        self.snapshot.send_modify(|s| {
            for (category, result) in results {
                match result {
                    Ok(data) => {
                        s.quotas.insert(category, data);
                        succeeded += 1;
                    }
                    Err(e) => failures.push(format!("{}: {}", category, e)),
                }
            }
            s.quota_error = if failures.is_empty() {
                None
            } else {
                Some(failures.join("; "))
            };
            s.last_quota_refresh = Some(Utc::now());
            quotas = s.quotas.clone();
        });

        let threshold = self.threshold();
        let notifications = self
            .quota_alerts
            .lock()
            .map(|mut alerts| alerts.evaluate(&quotas, threshold))
            .unwrap_or_default();
        for event in notifications {
            self.notifier.notify(event);
        }

        if !failures.is_empty() {
            log::warn!("[refresh] Quota refresh failed for {}", failures.join("; "));
        }
        self.events.emit(CoreEvent::QuotaUpdated);
        QuotaRefreshOutcome::Completed {
            succeeded,
            failed: failures.len(),
        }
    }
}
