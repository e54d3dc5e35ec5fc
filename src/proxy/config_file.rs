//! Targeted edits of the proxy's YAML config.
//!
//! The file format belongs to CLIProxyAPI and is treated as opaque text. Only
//! the first `port:` line and the first `secret-key:` line are ever rewritten,
//! so hand edits elsewhere in the file survive every sync.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::CoreResult;

lazy_static! {
    static ref PORT_LINE: Regex = Regex::new(r"(?m)^([ \t]*port:[ \t]*)\d+").unwrap();
    static ref SECRET_KEY_LINE: Regex =
        Regex::new(r#"(?m)^([ \t]*secret-key:[ \t]*)"(?:[^"\\\n]|\\.)*""#).unwrap();
}

/// Values written into a freshly created config only.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyDefaults {
    pub request_retry: u16,
    pub quota_switch_project: bool,
    pub quota_switch_preview_model: bool,
    pub routing_strategy: String,
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            request_retry: 3,
            quota_switch_project: false,
            quota_switch_preview_model: false,
            routing_strategy: "round-robin".to_string(),
        }
    }
}

pub struct ConfigSynchronizer {
    path: PathBuf,
    defaults: ProxyDefaults,
}

impl ConfigSynchronizer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            defaults: ProxyDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: ProxyDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the default config if no file exists. An existing file is
    /// never touched, whatever it contains.
    pub fn ensure_exists(&self, initial_port: u16, secret_key: &str, auth_dir: &Path) -> CoreResult<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = render_default_config(initial_port, secret_key, auth_dir, &self.defaults);
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes())?;
                log::info!("[config] Created proxy config at {:?}", self.path);
                Ok(())
            }
            // Lost a race with another writer; theirs wins.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_port(&self, port: u16) -> CoreResult<()> {
        self.rewrite(&PORT_LINE, &port.to_string(), "port")
    }

    /// CLIProxyAPI replaces the plaintext key with a hash on startup, so this
    /// runs before every launch to restore the value the client sends.
    pub fn set_secret_key(&self, key: &str) -> CoreResult<()> {
        self.rewrite(&SECRET_KEY_LINE, &quote(key), "secret-key")
    }

    pub fn read_port(&self) -> Option<u16> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let caps = PORT_LINE.captures(&content)?;
        let whole = caps.get(0)?.as_str();
        whole[caps[1].len()..].parse().ok()
    }

    pub fn read_secret_key(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let caps = SECRET_KEY_LINE.captures(&content)?;
        let quoted = &caps.get(0)?.as_str()[caps[1].len()..];
        Some(unquote(quoted))
    }

    fn rewrite(&self, pattern: &Regex, value: &str, field: &str) -> CoreResult<()> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[config] {:?} missing, skipping {} update", self.path, field);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(updated) = replace_first(pattern, &content, value) else {
            log::debug!("[config] No `{}` line in {:?}, leaving file as is", field, self.path);
            return Ok(());
        };
        if updated == content {
            return Ok(());
        }
        write_atomically(&self.path, &updated)
    }
}

/// Replaces the value part of the first match, keeping the captured prefix.
fn replace_first(pattern: &Regex, content: &str, value: &str) -> Option<String> {
    if !pattern.is_match(content) {
        return None;
    }
    let replaced = pattern.replacen(content, 1, |caps: &Captures| format!("{}{}", &caps[1], value));
    Some(replaced.into_owned())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn unquote(quoted: &str) -> String {
    let inner = quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(quoted);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn write_atomically(path: &Path, content: &str) -> CoreResult<()> {
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, content)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn render_default_config(port: u16, secret_key: &str, auth_dir: &Path, defaults: &ProxyDefaults) -> String {
    format!(
        r#"# ProxyPal generated config
port: {}
auth-dir: {}
api-keys:
  - "proxypal-local"
debug: false
logging-to-file: false
usage-statistics-enabled: true
request-retry: {}

# Quota exceeded behavior
quota-exceeded:
  switch-project: {}
  switch-preview-model: {}

routing:
  strategy: {}

# Enable Management API for OAuth flows
remote-management:
  allow-remote: false
  secret-key: {}
  disable-control-panel: true
"#,
        port,
        quote(&auth_dir.to_string_lossy()),
        defaults.request_retry,
        defaults.quota_switch_project,
        defaults.quota_switch_preview_model,
        quote(&defaults.routing_strategy),
        quote(secret_key),
    )
}
