use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Latest-release payload. GitHub's `tag_name` / `browser_download_url`
/// field names are accepted alongside the short ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    #[serde(alias = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(alias = "browser_download_url")]
    pub download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

const KNOWN_OS: &[&str] = &["darwin", "macos", "linux", "windows", "freebsd"];

const EXCLUDED_SUFFIXES: &[&str] = &[
    ".sha256", ".sha512", ".md5", ".sig", ".asc", ".pem", ".txt", ".sbom", ".json",
];

impl Platform {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    /// Host platform in release-asset vocabulary (`darwin`, `amd64`, ...).
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(os, arch)
    }

    fn os_aliases(&self) -> Vec<&str> {
        match self.os.as_str() {
            "darwin" | "macos" => vec!["darwin", "macos"],
            other => vec![other],
        }
    }

    fn arch_aliases(&self) -> Vec<&str> {
        match self.arch.as_str() {
            "amd64" | "x86_64" => vec!["amd64", "x86_64", "x64"],
            "arm64" | "aarch64" => vec!["arm64", "aarch64"],
            other => vec![other],
        }
    }

    fn matches(&self, asset_name: &str) -> bool {
        let name = asset_name.to_lowercase();
        if is_checksum_or_signature(&name) {
            return false;
        }
        let os_aliases = self.os_aliases();
        let foreign_os = KNOWN_OS
            .iter()
            .filter(|os| !os_aliases.contains(os))
            .any(|os| name.contains(os));
        if foreign_os {
            return false;
        }
        os_aliases.iter().any(|os| name.contains(os))
            && self.arch_aliases().iter().any(|arch| name.contains(arch))
    }
}

fn is_checksum_or_signature(lower_name: &str) -> bool {
    lower_name.contains("checksum")
        || EXCLUDED_SUFFIXES
            .iter()
            .any(|suffix| lower_name.ends_with(suffix))
}

fn archive_rank(name: &str) -> u8 {
    let name = name.to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        0
    } else if name.ends_with(".zip") {
        1
    } else {
        2
    }
}

/// Picks the single asset built for `platform`, preferring tarballs, then
/// zips, then bare binaries.
pub fn select_asset<'a>(manifest: &'a ReleaseManifest, platform: &Platform) -> CoreResult<&'a ReleaseAsset> {
    manifest
        .assets
        .iter()
        .filter(|asset| platform.matches(&asset.name))
        .min_by_key(|asset| archive_rank(&asset.name))
        .ok_or_else(|| CoreError::NoCompatibleBinary {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(names: &[&str]) -> ReleaseManifest {
        ReleaseManifest {
            tag: "v6.6.0".to_string(),
            assets: names
                .iter()
                .map(|name| ReleaseAsset {
                    name: name.to_string(),
                    download_url: format!("https://example.invalid/{}", name),
                })
                .collect(),
        }
    }

    const ASSETS: &[&str] = &[
        "app_darwin_amd64.tar.gz",
        "app_darwin_arm64.tar.gz",
        "app_linux_amd64",
        "checksums.txt",
    ];

    #[test]
    fn picks_arm64_darwin_build() {
        let m = manifest(ASSETS);
        let asset = select_asset(&m, &Platform::new("darwin", "arm64")).unwrap();
        assert_eq!(asset.name, "app_darwin_arm64.tar.gz");
    }

    #[test]
    fn picks_amd64_darwin_build() {
        let m = manifest(ASSETS);
        let asset = select_asset(&m, &Platform::new("darwin", "amd64")).unwrap();
        assert_eq!(asset.name, "app_darwin_amd64.tar.gz");
    }

    #[test]
    fn no_darwin_asset_is_an_error() {
        let m = manifest(&["app_linux_amd64", "app_windows_amd64.zip", "checksums.txt"]);
        let err = select_asset(&m, &Platform::new("darwin", "arm64")).unwrap_err();
        assert!(matches!(err, CoreError::NoCompatibleBinary { .. }));
    }

    #[test]
    fn checksum_files_never_win() {
        let m = manifest(&["app_linux_amd64.tar.gz.sha256", "app_linux_amd64.tar.gz"]);
        let asset = select_asset(&m, &Platform::new("linux", "amd64")).unwrap();
        assert_eq!(asset.name, "app_linux_amd64.tar.gz");
    }

    #[test]
    fn archives_are_preferred_over_bare_binaries() {
        let m = manifest(&["app_linux_amd64", "app_linux_amd64.zip", "app_linux_amd64.tar.gz"]);
        let asset = select_asset(&m, &Platform::new("linux", "amd64")).unwrap();
        assert_eq!(asset.name, "app_linux_amd64.tar.gz");
    }

    #[test]
    fn arch_aliases_match() {
        let m = manifest(&["CLIProxyAPI_6.6.0_Linux_x86_64.tar.gz"]);
        assert!(select_asset(&m, &Platform::new("linux", "amd64")).is_ok());
        assert!(select_asset(&m, &Platform::new("linux", "arm64")).is_err());
    }

    #[test]
    fn github_field_names_deserialize() {
        let json = r#"{
            "tag_name": "v6.6.1",
            "name": "v6.6.1",
            "assets": [
                {"name": "a_darwin_arm64.tar.gz", "url": "api", "browser_download_url": "https://dl/a"}
            ]
        }"#;
        let m: ReleaseManifest = serde_json::from_str(json).unwrap();
        assert_eq!(m.tag, "v6.6.1");
        assert_eq!(m.assets[0].download_url, "https://dl/a");
    }
}
