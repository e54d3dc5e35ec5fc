//! Downloads and installs the CLIProxyAPI release built for this host.

pub mod extract;
pub mod manifest;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, EventBus};
use crate::settings::RuntimeConfig;

pub use extract::ArchiveKind;
pub use manifest::{select_asset, Platform, ReleaseAsset, ReleaseManifest};

const VERSION_MARKER: &str = ".version";

// Share of the progress bar covered by the download itself.
const DOWNLOAD_SHARE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallationState {
    pub is_downloading: bool,
    pub progress: f64,
    pub last_error: Option<String>,
}

pub struct ReleaseInstaller {
    http: reqwest::Client,
    manifest_url: String,
    manifest_timeout: std::time::Duration,
    target: PathBuf,
    platform: Platform,
    state: watch::Sender<InstallationState>,
    lock: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl ReleaseInstaller {
    pub fn new(target: impl Into<PathBuf>, config: &RuntimeConfig, events: EventBus) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.download_connect_timeout)
            .user_agent(concat!("proxypal-core/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let (state, _) = watch::channel(InstallationState::default());
        Ok(Self {
            http,
            manifest_url: config.release_manifest_url.clone(),
            manifest_timeout: config.manifest_timeout,
            target: target.into(),
            platform: Platform::current(),
            state,
            lock: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn is_installed(&self) -> bool {
        self.target.is_file()
    }

    /// Release tag recorded by the last successful install.
    pub fn installed_version(&self) -> Option<String> {
        let marker = self.target.parent()?.join(VERSION_MARKER);
        std::fs::read_to_string(marker)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn state(&self) -> InstallationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallationState> {
        self.state.subscribe()
    }

    /// Installs the latest release over any existing binary. Concurrent
    /// calls are rejected with [`CoreError::InstallInProgress`].
    pub async fn install(&self) -> CoreResult<PathBuf> {
        let _guard = self.lock.try_lock().map_err(|_| CoreError::InstallInProgress)?;

        self.update_state(|s| {
            s.is_downloading = true;
            s.progress = 0.0;
            s.last_error = None;
        });

        let result = self.run_install().await;
        match &result {
            Ok(path) => {
                log::info!("[installer] Installed CLIProxyAPI at {:?}", path);
                self.update_state(|s| {
                    s.is_downloading = false;
                    s.progress = 1.0;
                });
            }
            Err(e) => {
                log::error!("[installer] Install failed: {}", e);
                let message = e.to_string();
                self.update_state(|s| {
                    s.is_downloading = false;
                    s.last_error = Some(message);
                });
            }
        }
        result
    }

    async fn run_install(&self) -> CoreResult<PathBuf> {
        let manifest = self.fetch_manifest().await?;
        let asset = select_asset(&manifest, &self.platform)?.clone();
        log::info!("[installer] Selected {} from release {}", asset.name, manifest.tag);

        let scratch = ScratchDir::create()?;
        let file_name = Path::new(&asset.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        let download_path = scratch.path().join(file_name);
        self.download(&asset.download_url, &download_path).await?;

        let binary = match ArchiveKind::from_name(&asset.name) {
            ArchiveKind::Raw => download_path,
            kind => {
                let extract_dir = scratch.path().join("extracted");
                tokio::task::spawn_blocking(move || {
                    extract::extract(kind, &download_path, &extract_dir)?;
                    extract::find_binary(&extract_dir).ok_or_else(|| {
                        CoreError::ExtractionFailed("no proxy binary found in archive".to_string())
                    })
                })
                .await
                .map_err(|e| CoreError::ExtractionFailed(format!("extract task failed: {}", e)))??
            }
        };

        replace_binary(&binary, &self.target)?;
        if let Some(dir) = self.target.parent() {
            if let Err(e) = std::fs::write(dir.join(VERSION_MARKER), &manifest.tag) {
                log::warn!("[installer] Failed to record installed version: {}", e);
            }
        }
        Ok(self.target.clone())
    }

    pub async fn fetch_manifest(&self) -> CoreResult<ReleaseManifest> {
        let response = self
            .http
            .get(&self.manifest_url)
            .header("Accept", "application/vnd.github+json")
            .timeout(self.manifest_timeout)
            .send()
            .await
            .map_err(|e| CoreError::ManifestFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::ManifestFetch(format!("HTTP {}", response.status())));
        }

        response
            .json::<ReleaseManifest>()
            .await
            .map_err(|e| CoreError::ManifestFetch(format!("malformed manifest: {}", e)))
    }

    async fn download(&self, url: &str, dest: &Path) -> CoreResult<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::DownloadFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::DownloadFailed(format!("HTTP {}", response.status())));
        }

        let total = response.content_length().filter(|t| *t > 0);
        let file = tokio::fs::File::create(dest).await?;
        let mut file = tokio::io::BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CoreError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(total) = total {
                let fraction = (downloaded as f64 / total as f64).min(1.0);
                self.report_progress(fraction * DOWNLOAD_SHARE);
            }
        }
        file.flush().await?;
        self.report_progress(DOWNLOAD_SHARE);
        log::debug!("[installer] Downloaded {} bytes", downloaded);
        Ok(())
    }

    /// Never moves backwards; emits an event once per whole percent.
    fn report_progress(&self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        let mut emit = None;
        self.state.send_if_modified(|s| {
            if progress <= s.progress {
                return false;
            }
            let crossed_percent = (progress * 100.0).floor() > (s.progress * 100.0).floor();
            s.progress = progress;
            if crossed_percent {
                emit = Some(s.clone());
            }
            true
        });
        if let Some(state) = emit {
            self.events.emit(CoreEvent::InstallProgress(state));
        }
    }

    fn update_state(&self, f: impl FnOnce(&mut InstallationState)) {
        self.state.send_modify(f);
        self.events.emit(CoreEvent::InstallProgress(self.state()));
    }
}

/// Temp directory removed on drop, whatever path the install took.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create() -> CoreResult<Self> {
        let path = std::env::temp_dir().join(format!("proxypal-install-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            log::debug!("[installer] Failed to clean {:?}: {}", self.0, e);
        }
    }
}

/// Stages next to the target so the final rename stays on one filesystem.
fn replace_binary(source: &Path, target: &Path) -> CoreResult<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cli-proxy-api".to_string());
    let staged = target.with_file_name(format!("{}.new", file_name));
    std::fs::copy(source, &staged)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(windows)]
    if target.exists() {
        std::fs::remove_file(target)?;
    }

    if let Err(e) = std::fs::rename(&staged, target) {
        let _ = std::fs::remove_file(&staged);
        return Err(e.into());
    }
    Ok(())
}
