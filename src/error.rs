use std::path::PathBuf;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Proxy binary not found at {}", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("Proxy failed to start: {0}")]
    StartupFailed(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("No compatible binary for {os}/{arch}")]
    NoCompatibleBinary { os: String, arch: String },
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    #[error("Failed to fetch release manifest: {0}")]
    ManifestFetch(String),
    #[error("Proxy is not running")]
    ProxyUnavailable,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("An installation is already in progress")]
    InstallInProgress,
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Network(err.to_string())
    }
}

impl CoreError {
    /// Short text suitable for a status line or notification body.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::BinaryNotFound(_) => {
                "CLIProxyAPI is not installed. Install it before starting the proxy.".to_string()
            }
            CoreError::StartupFailed(msg) => format!("Proxy exited during startup: {}", msg),
            CoreError::Network(msg) => {
                if msg.contains("Connection refused") || msg.contains("connection refused") {
                    "Cannot reach the proxy. Is it running?".to_string()
                } else {
                    format!("Network error: {}", msg)
                }
            }
            CoreError::NoCompatibleBinary { os, arch } => {
                format!("No CLIProxyAPI release is published for {}/{}.", os, arch)
            }
            CoreError::ProxyUnavailable => "Start the proxy first.".to_string(),
            other => other.to_string(),
        }
    }
}
