#![cfg(unix)]

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use proxypal_core::events::{EventBus, NotificationEvent};
use proxypal_core::proxy::{ConfigSynchronizer, ProcessPhase, ProcessSupervisor, SupervisorOptions};
use proxypal_core::CoreError;
use support::{write_script, RecordingNotifier};

const LONG_RUNNING: &str = "echo \"CLIProxyAPI listening\"\nexec sleep 30";

fn supervisor(root: &Path, grace: Duration) -> (ProcessSupervisor, Arc<RecordingNotifier>) {
    let notifier = RecordingNotifier::new();
    let supervisor = ProcessSupervisor::new(
        SupervisorOptions {
            binary_path: root.join("bin").join("cli-proxy-api"),
            auth_dir: root.join("auth"),
            port: 18317,
            secret_key: "first-key".to_string(),
            startup_grace: grace,
            stop_timeout: Duration::from_secs(5),
        },
        ConfigSynchronizer::new(root.join("proxy-config.yaml")),
        notifier.clone(),
        EventBus::default(),
    );
    (supervisor, notifier)
}

#[tokio::test]
async fn missing_binary_fails_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, _notifier) = supervisor(dir.path(), Duration::from_millis(200));

    let err = supervisor.start().await.unwrap_err();

    assert!(matches!(err, CoreError::BinaryNotFound(_)));
    assert!(!supervisor.is_running());
    assert_eq!(supervisor.phase(), ProcessPhase::Stopped);
    assert!(supervisor.last_error().is_some());
    assert!(!dir.path().join("proxy-config.yaml").exists());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_is_a_noop_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir.path().join("bin"), "cli-proxy-api", LONG_RUNNING);
    let (supervisor, notifier) = supervisor(dir.path(), Duration::from_millis(200));

    let idle = supervisor.stop().await.unwrap();
    assert!(!idle.running);

    let status = supervisor.start().await.unwrap();
    assert!(status.running);
    assert_eq!(supervisor.phase(), ProcessPhase::Running);
    let pid = supervisor.pid().await;
    assert!(pid.is_some());

    let again = supervisor.start().await.unwrap();
    assert!(again.running);
    assert_eq!(supervisor.pid().await, pid);

    let stopped = supervisor.stop().await.unwrap();
    assert!(!stopped.running);
    assert_eq!(supervisor.phase(), ProcessPhase::Stopped);
    assert!(supervisor.stop().await.is_ok());

    // A requested stop is not a crash.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notifier.take().is_empty());
    assert!(supervisor.last_error().is_none());
}

#[tokio::test]
async fn start_writes_port_and_key_into_config() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir.path().join("bin"), "cli-proxy-api", LONG_RUNNING);
    let (supervisor, _notifier) = supervisor(dir.path(), Duration::from_millis(200));

    supervisor.set_port(19000).unwrap();
    supervisor.set_secret_key("rotated-key").unwrap();
    let status = supervisor.start().await.unwrap();

    assert_eq!(status.port, 19000);
    let config = supervisor.config();
    assert_eq!(config.read_port(), Some(19000));
    assert_eq!(config.read_secret_key().as_deref(), Some("rotated-key"));

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn early_exit_is_a_startup_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir.path().join("bin"), "cli-proxy-api", "echo \"bad config\" >&2\nexit 3");
    let (supervisor, notifier) = supervisor(dir.path(), Duration::from_millis(1500));

    let err = supervisor.start().await.unwrap_err();

    match err {
        CoreError::StartupFailed(message) => assert!(message.contains("code 3"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!supervisor.is_running());
    assert_eq!(supervisor.phase(), ProcessPhase::Stopped);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notifier.take().is_empty());
}

#[tokio::test]
async fn unexpected_exit_marks_stopped_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir.path().join("bin"), "cli-proxy-api", "sleep 1\nexit 7");
    let (supervisor, notifier) = supervisor(dir.path(), Duration::from_millis(100));

    supervisor.start().await.unwrap();
    let mut status = supervisor.subscribe();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| !s.running))
        .await
        .expect("process should have exited")
        .unwrap();

    assert_eq!(supervisor.phase(), ProcessPhase::Stopped);
    assert!(supervisor.last_error().unwrap().contains("code 7"));
    assert_eq!(notifier.take(), vec![NotificationEvent::ProxyCrashed { exit_code: 7 }]);

    // The crashed process no longer blocks a fresh start.
    write_script(&dir.path().join("bin"), "cli-proxy-api", LONG_RUNNING);
    assert!(supervisor.start().await.unwrap().running);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn clean_exit_is_not_reported_as_crash() {
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir.path().join("bin"), "cli-proxy-api", "sleep 1\nexit 0");
    let (supervisor, notifier) = supervisor(dir.path(), Duration::from_millis(100));

    supervisor.start().await.unwrap();
    let mut status = supervisor.subscribe();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| !s.running))
        .await
        .expect("process should have exited")
        .unwrap();

    assert!(notifier.take().is_empty());
    assert!(supervisor.last_error().is_none());
}
