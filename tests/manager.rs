#![cfg(unix)]

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proxypal_core::events::{NotificationEvent, NotificationPreferences};
use proxypal_core::settings::{keys, MemorySettings, BINARY_NAME};
use proxypal_core::{
    Collaborators, CoreError, CoreSettings, Paths, ProxyManager, RuntimeConfig, SettingsStore,
};
use serde_json::Value;
use support::{write_script, RecordingNotifier, RecordingOpener, Route, TestServer};

const LONG_RUNNING: &str = "exec sleep 30";

struct Harness {
    manager: ProxyManager,
    store: Arc<MemorySettings>,
    notifier: Arc<RecordingNotifier>,
    paths: Paths,
    _dir: tempfile::TempDir,
    _server: TestServer,
}

async fn harness(script: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::under(dir.path());
    if let Some(body) = script {
        write_script(paths.binary_path.parent().unwrap(), BINARY_NAME, body);
    }

    // Nothing in these tests should reach a real release server.
    let server = TestServer::start(HashMap::from([(
        "/releases/latest".to_string(),
        Route::status(503, "offline"),
    )]))
    .await;
    let runtime = RuntimeConfig {
        startup_grace: Duration::from_millis(200),
        release_manifest_url: server.url("/releases/latest"),
        ..Default::default()
    };

    let store = Arc::new(MemorySettings::default());
    store.set(keys::PORT, Value::from(45_731)).unwrap();
    let notifier = RecordingNotifier::new();
    let manager = ProxyManager::new(
        paths.clone(),
        store.clone(),
        runtime,
        Collaborators {
            notifier: notifier.clone(),
            opener: RecordingOpener::new(),
            quota_sources: Vec::new(),
        },
    )
    .unwrap();

    Harness {
        manager,
        store,
        notifier,
        paths,
        _dir: dir,
        _server: server,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn start_and_stop_drive_process_and_polling() {
    let h = harness(Some(LONG_RUNNING)).await;

    let status = h.manager.start().await.unwrap();

    assert!(status.running);
    assert_eq!(status.port, 45_731);
    assert!(h.manager.scheduler().is_running());
    let config = std::fs::read_to_string(&h.paths.config_path).unwrap();
    let key = h.manager.settings().management_key;
    assert!(config.contains(&format!("secret-key: \"{}\"", key)));
    assert!(config.contains("port: 45731"));

    let status = h.manager.stop().await.unwrap();
    assert!(!status.running);
    assert!(!h.manager.scheduler().is_running());
    assert!(h.notifier.take().is_empty());
}

#[tokio::test]
async fn crash_halts_polling_and_notifies() {
    let h = harness(Some("sleep 1\nexit 9")).await;

    h.manager.start().await.unwrap();
    assert!(h.manager.scheduler().is_running());

    wait_until(|| !h.manager.status().running).await;
    wait_until(|| !h.manager.scheduler().is_running()).await;
    assert_eq!(h.notifier.take(), vec![NotificationEvent::ProxyCrashed { exit_code: 9 }]);
}

#[tokio::test]
async fn crash_notification_respects_preferences() {
    let h = harness(Some("sleep 1\nexit 9")).await;
    h.manager
        .set_notification_preferences(NotificationPreferences {
            notify_on_crash: false,
            ..Default::default()
        })
        .unwrap();

    h.manager.start().await.unwrap();
    wait_until(|| !h.manager.scheduler().is_running()).await;

    assert!(h.notifier.take().is_empty());
    assert_eq!(h.store.get(keys::NOTIFY_ON_CRASH), Some(Value::Bool(false)));
}

#[tokio::test]
async fn restart_picks_up_new_port() {
    let h = harness(Some(LONG_RUNNING)).await;
    h.manager.start().await.unwrap();

    h.manager.set_port(45_800).unwrap();
    let status = h.manager.restart().await.unwrap();

    assert!(status.running);
    assert_eq!(status.port, 45_800);
    assert!(h.manager.scheduler().is_running());
    assert_eq!(h.store.get(keys::PORT), Some(Value::from(45_800)));
    assert_eq!(CoreSettings::load(h.store.as_ref()).unwrap().port, 45_800);
    let config = std::fs::read_to_string(&h.paths.config_path).unwrap();
    assert!(config.contains("port: 45800"));

    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn rotated_key_reaches_settings_and_config() {
    let h = harness(Some(LONG_RUNNING)).await;
    let original = h.manager.settings().management_key;
    h.manager.start().await.unwrap();

    let rotated = h.manager.rotate_management_key().unwrap();

    assert_ne!(rotated, original);
    assert_eq!(rotated.len(), 32);
    assert_eq!(h.store.get(keys::MANAGEMENT_KEY), Some(Value::from(rotated.clone())));
    assert_eq!(
        h.manager.supervisor().config().read_secret_key().as_deref(),
        Some(rotated.as_str())
    );

    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn quota_threshold_is_clamped_and_saved() {
    let h = harness(None).await;

    h.manager.set_quota_alert_threshold(150.0).unwrap();
    assert_eq!(h.manager.settings().quota_alert_threshold, 100.0);

    h.manager.set_quota_alert_threshold(-5.0).unwrap();
    assert_eq!(h.store.get(keys::QUOTA_ALERT_THRESHOLD), Some(Value::from(0.0)));
}

#[tokio::test]
async fn start_without_binary_reports_install_failure() {
    let h = harness(None).await;

    let err = h.manager.start().await.unwrap_err();

    assert!(matches!(err, CoreError::ManifestFetch(_)));
    assert!(!h.manager.status().running);
    assert!(!h.manager.scheduler().is_running());
    assert!(h.manager.installer().state().last_error.is_some());
}
