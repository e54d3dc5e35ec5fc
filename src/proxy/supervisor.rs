//! Ownership of the CLIProxyAPI child process.
//!
//! Start and stop run under one async mutex. The child itself is owned by a
//! monitor task; when it exits, the monitor reports a [`ProcessExit`] over a
//! channel to a coordinator task, which applies it only if that process still
//! owns the handle. Exits that race with `stop()` or a restart are ignored.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use super::{ConfigSynchronizer, ProcessPhase, ProxyStatus};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus, NotificationEvent, StatusChangeNotifier};

pub struct SupervisorOptions {
    pub binary_path: PathBuf,
    pub auth_dir: PathBuf,
    pub port: u16,
    pub secret_key: String,
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
    requested: bool,
}

#[derive(Debug)]
struct ProcessExit {
    generation: u64,
    info: ExitInfo,
}

struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

struct Shared {
    binary_path: PathBuf,
    auth_dir: PathBuf,
    config: ConfigSynchronizer,
    startup_grace: Duration,
    stop_timeout: Duration,
    secret_key: Mutex<String>,
    status: watch::Sender<ProxyStatus>,
    phase: watch::Sender<ProcessPhase>,
    last_error: Mutex<Option<String>>,
    handle: tokio::sync::Mutex<Option<ProcessHandle>>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    generation: AtomicU64,
    notifier: Arc<dyn StatusChangeNotifier>,
    events: EventBus,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// Must be called from within a Tokio runtime; the exit coordinator is
    /// spawned here.
    pub fn new(
        options: SupervisorOptions,
        config: ConfigSynchronizer,
        notifier: Arc<dyn StatusChangeNotifier>,
        events: EventBus,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ProxyStatus::new(options.port));
        let (phase, _) = watch::channel(ProcessPhase::Stopped);

        let shared = Arc::new(Shared {
            binary_path: options.binary_path,
            auth_dir: options.auth_dir,
            config,
            startup_grace: options.startup_grace,
            stop_timeout: options.stop_timeout,
            secret_key: Mutex::new(options.secret_key),
            status,
            phase,
            last_error: Mutex::new(None),
            handle: tokio::sync::Mutex::new(None),
            exit_tx,
            generation: AtomicU64::new(0),
            notifier,
            events,
        });

        tokio::spawn(coordinate_exits(Arc::downgrade(&shared), exit_rx));
        Self { shared }
    }

    pub fn status(&self) -> ProxyStatus {
        self.shared.status.borrow().clone()
    }

    pub fn phase(&self) -> ProcessPhase {
        *self.shared.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.shared.status.borrow().running
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<ProxyStatus> {
        self.shared.status.subscribe()
    }

    pub fn binary_path(&self) -> &Path {
        &self.shared.binary_path
    }

    pub fn config(&self) -> &ConfigSynchronizer {
        &self.shared.config
    }

    pub fn secret_key(&self) -> String {
        self.shared
            .secret_key
            .lock()
            .map(|k| k.clone())
            .unwrap_or_default()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.shared.handle.lock().await.as_ref().and_then(|h| h.pid)
    }

    /// Launches the proxy unless it is already running.
    pub async fn start(&self) -> CoreResult<ProxyStatus> {
        let shared = &self.shared;
        let mut slot = shared.handle.lock().await;

        let existing = slot.as_ref().map(|h| *h.exited.borrow());
        match existing {
            Some(None) => return Ok(self.status()),
            // Died but the coordinator has not caught up yet.
            Some(Some(info)) => shared.apply_exit(&mut slot, info),
            None => {}
        }

        if !shared.binary_path.is_file() {
            let err = CoreError::BinaryNotFound(shared.binary_path.clone());
            shared.record_error(&err);
            return Err(err);
        }

        shared.phase.send_replace(ProcessPhase::Starting);
        match shared.launch().await {
            Ok(handle) => {
                *slot = Some(handle);
                shared.clear_error();
                shared.phase.send_replace(ProcessPhase::Running);
                let status = shared.set_running(true);
                log::info!("[supervisor] CLIProxyAPI running on {}", status.endpoint());
                Ok(status)
            }
            Err(err) => {
                shared.phase.send_replace(ProcessPhase::Stopped);
                shared.set_running(false);
                shared.record_error(&err);
                Err(err)
            }
        }
    }

    /// Kills the proxy and waits (bounded) for it to exit. No-op when idle.
    pub async fn stop(&self) -> CoreResult<ProxyStatus> {
        let shared = &self.shared;
        let mut slot = shared.handle.lock().await;
        let Some(mut handle) = slot.take() else {
            return Ok(self.status());
        };

        let exited = *handle.exited.borrow();
        if let Some(info) = exited {
            shared.apply_exit(&mut slot, info);
            return Ok(self.status());
        }

        if let Some(kill) = handle.kill.take() {
            let _ = kill.send(());
        }
        let exited_in_time = tokio::time::timeout(shared.stop_timeout, async {
            handle.exited.wait_for(|e| e.is_some()).await.is_ok()
        })
        .await
        .unwrap_or(false);
        if !exited_in_time {
            log::warn!(
                "[supervisor] CLIProxyAPI did not exit within {:?}",
                shared.stop_timeout
            );
        }

        shared.phase.send_replace(ProcessPhase::Stopped);
        let status = shared.set_running(false);
        log::info!("[supervisor] CLIProxyAPI stopped");
        Ok(status)
    }

    /// Records the new port and rewrites the config. A running process keeps
    /// its old port until the caller restarts it.
    pub fn set_port(&self, port: u16) -> CoreResult<()> {
        self.shared.status.send_modify(|s| s.port = port);
        self.shared.config.set_port(port)
    }

    pub fn set_secret_key(&self, key: &str) -> CoreResult<()> {
        if let Ok(mut current) = self.shared.secret_key.lock() {
            *current = key.to_string();
        }
        self.shared.config.set_secret_key(key)
    }
}

impl Shared {
    async fn launch(&self) -> CoreResult<ProcessHandle> {
        let port = self.status.borrow().port;
        let key = self.secret_key.lock().map(|k| k.clone()).unwrap_or_default();
        self.config.ensure_exists(port, &key, &self.auth_dir)?;
        self.config.set_port(port)?;
        self.config.set_secret_key(&key)?;

        let work_dir = self
            .binary_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let writable_dir = self
            .config
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| work_dir.clone());

        let mut command = Command::new(&self.binary_path);
        command
            .arg("-config")
            .arg(self.config.path())
            .current_dir(&work_dir)
            .env("TERM", "xterm-256color")
            // Keeps CLIProxyAPI's own logs next to its config.
            .env("WRITABLE_PATH", &writable_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::info!(
            "[supervisor] Executing: {} -config {}",
            self.binary_path.display(),
            self.config.path().display()
        );
        let mut child = command.spawn().map_err(|e| {
            CoreError::StartupFailed(format!("failed to spawn {}: {}", self.binary_path.display(), e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, true));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(None);
        let exit_tx = self.exit_tx.clone();

        tokio::spawn(async move {
            let (status, requested) = tokio::select! {
                status = child.wait() => (status, false),
                _ = kill_rx => {
                    let _ = child.start_kill();
                    (child.wait().await, true)
                }
            };
            let info = ExitInfo {
                code: status.ok().and_then(|s| s.code()),
                requested,
            };
            log::info!("[CLIProxyAPI] Process terminated: {:?}", info);
            let _ = exited_tx.send(Some(info));
            let _ = exit_tx.send(ProcessExit { generation, info });
        });

        let mut exited = exited_rx.clone();
        let early_exit = tokio::time::timeout(self.startup_grace, async move {
            exited.wait_for(|e| e.is_some()).await.ok().and_then(|info| *info)
        })
        .await;

        match early_exit {
            Ok(Some(info)) => Err(CoreError::StartupFailed(match info.code {
                Some(code) => format!("process exited with code {}", code),
                None => "process was terminated by a signal".to_string(),
            })),
            Ok(None) => Err(CoreError::StartupFailed("process monitor went away".to_string())),
            Err(_) => Ok(ProcessHandle {
                generation,
                pid,
                kill: Some(kill_tx),
                exited: exited_rx,
            }),
        }
    }

    fn apply_exit(&self, slot: &mut Option<ProcessHandle>, info: ExitInfo) {
        *slot = None;
        self.phase.send_replace(ProcessPhase::Stopped);
        self.set_running(false);

        if info.requested || info.code == Some(0) {
            return;
        }
        let exit_code = info.code.unwrap_or(-1);
        let message = format!("CLIProxyAPI exited unexpectedly with code {}", exit_code);
        log::error!("[supervisor] {}", message);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
        self.notifier.notify(NotificationEvent::ProxyCrashed { exit_code });
    }

    fn set_running(&self, running: bool) -> ProxyStatus {
        self.status.send_modify(|s| s.running = running);
        let status = self.status.borrow().clone();
        self.events.emit(CoreEvent::ProxyStatusChanged(status.clone()));
        status
    }

    fn record_error(&self, err: &CoreError) {
        log::error!("[supervisor] {}", err);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
    }

    fn clear_error(&self) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = None;
        }
    }
}

async fn coordinate_exits(shared: Weak<Shared>, mut exits: mpsc::UnboundedReceiver<ProcessExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut slot = shared.handle.lock().await;
        let owns_handle = slot
            .as_ref()
            .map(|h| h.generation == exit.generation)
            .unwrap_or(false);
        if owns_handle {
            shared.apply_exit(&mut slot, exit.info);
        } else {
            log::debug!(
                "[supervisor] Ignoring exit of stale process generation {}",
                exit.generation
            );
        }
    }
}

// Reading the pipes keeps the child from blocking on a full buffer.
async fn drain_output<R: AsyncRead + Unpin>(stream: R, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            log::warn!("[CLIProxyAPI ERROR] {}", line);
        } else {
            log::info!("[CLIProxyAPI] {}", line);
        }
    }
}
