use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Archive;

use crate::error::{CoreError, CoreResult};

/// Names CLIProxyAPI releases have shipped the server binary under.
const CANDIDATE_NAMES: &[&str] = &[
    "cli-proxy-api",
    "cliproxyapi",
    "cli-proxy-api-plus",
    "cliproxyapiplus",
];

const NON_BINARY_EXTENSIONS: &[&str] = &[
    "sh", "bash", "zsh", "ps1", "bat", "cmd", "md", "txt", "yaml", "yml", "json", "toml",
    "example", "html", "pdf", "gz", "zip",
];

const NON_BINARY_STEMS: &[&str] = &["readme", "license", "licence", "changelog", "notice"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
    Raw,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if name.ends_with(".zip") {
            ArchiveKind::Zip
        } else {
            ArchiveKind::Raw
        }
    }
}

/// Blocking; run on a blocking thread.
pub fn extract(kind: ArchiveKind, archive: &Path, dest: &Path) -> CoreResult<()> {
    std::fs::create_dir_all(dest)?;
    match kind {
        ArchiveKind::TarGz => extract_tar_gz(archive, dest),
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::Raw => Ok(()),
    }
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> CoreResult<()> {
    let file = File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| CoreError::ExtractionFailed(format!("tar.gz: {}", e)))
}

fn extract_zip(archive: &Path, dest: &Path) -> CoreResult<()> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::ExtractionFailed(format!("zip: {}", e)))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| CoreError::ExtractionFailed(format!("zip entry {}: {}", i, e)))?;
        // Skips entries that would escape `dest`.
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            log::warn!("[installer] Skipping unsafe zip entry {:?}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

/// Looks for a known binary name first, then for the first executable that
/// is not a script or document.
pub fn find_binary(root: &Path) -> Option<PathBuf> {
    let mut files = Vec::new();
    collect_files(root, &mut files);
    files.sort();

    files
        .iter()
        .find(|path| is_candidate_name(path))
        .or_else(|| files.iter().find(|path| is_executable(path) && !looks_like_non_binary(path)))
        .cloned()
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_files(&path, out),
            Ok(ft) if ft.is_file() => out.push(path),
            _ => {}
        }
    }
}

fn is_candidate_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_lowercase();
    let stem = lower.strip_suffix(".exe").unwrap_or(&lower);
    CANDIDATE_NAMES.contains(&stem)
}

fn looks_like_non_binary(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if name.starts_with('.') || NON_BINARY_STEMS.iter().any(|stem| name.starts_with(stem)) {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| NON_BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false)
}
