use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

const DEFAULT_POINTER_URL: &str = "https://ctgp7.page.link/baseCDNURL";
const DEFAULT_MIRROR_URL: &str = "https://ctgp7.net/cdn";

/// Slack kept free on the card beyond the exact size of the incoming files.
pub const DEFAULT_SPACE_RESERVE: u64 = 20_000_000;

/// A place the CDN base URL can be discovered from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "url", rename_all = "lowercase")]
pub enum CdnCandidate {
    /// The URL is the CDN base itself.
    Direct(String),
    /// Fetching the URL yields the CDN base as plain text.
    Pointer(String),
}

/// Knobs for an update run. Defaults target the CTGP-7 layout on a 3DS SD card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdaterConfig {
    /// CDN candidates, tried in this order.
    pub cdn_candidates: Vec<CdnCandidate>,
    /// Installation directory name below the target root.
    pub install_dir: String,
    /// Save-data subdirectory inside the installation. Never touched by the plan.
    pub save_dir: String,
    /// Marker subdirectory inside the installation.
    pub config_dir: String,
    /// Staging subdirectory inside the installation.
    pub staging_dir: String,
    /// Timeout for each CDN discovery attempt, in seconds.
    pub probe_timeout_secs: u64,
    /// Timeout for manifest and file downloads, in seconds.
    pub request_timeout_secs: u64,
    /// Bytes that must remain free after the update.
    pub space_reserve_bytes: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            cdn_candidates: vec![
                CdnCandidate::Pointer(DEFAULT_POINTER_URL.to_string()),
                CdnCandidate::Direct(DEFAULT_MIRROR_URL.to_string()),
            ],
            install_dir: "CTGP-7".to_string(),
            save_dir: "savefs".to_string(),
            config_dir: "config".to_string(),
            staging_dir: "staging".to_string(),
            probe_timeout_secs: 5,
            request_timeout_secs: 60,
            space_reserve_bytes: DEFAULT_SPACE_RESERVE,
        }
    }
}

impl UpdaterConfig {
    /// Read a JSON config file. Missing fields take their default value.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|err| UpdateError::fs(path, err))?;
        serde_json::from_slice(&raw).map_err(|err| {
            UpdateError::fs(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            )
        })
    }

    /// Per-candidate timeout used while looking for a CDN.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Timeout for each manifest or payload request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolves the conventional subtree for a target root.
    pub fn layout(&self, root: &Path) -> InstallLayout {
        let install = root.join(&self.install_dir);
        InstallLayout {
            root: root.to_path_buf(),
            config: install.join(&self.config_dir),
            save: install.join(&self.save_dir),
            staging: install.join(&self.staging_dir),
            backup: root.join(format!("{}savebak", self.install_dir)),
            save_dir_name: self.save_dir.clone(),
            staging_dir_name: self.staging_dir.clone(),
            install,
        }
    }
}

/// Paths of one installation on the target volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    /// Target root, usually the SD card mount point.
    pub root: PathBuf,
    /// Installation directory below the root.
    pub install: PathBuf,
    /// Holds the version, pending-update and reinstall markers.
    pub config: PathBuf,
    /// Save data. Never written by the engine.
    pub save: PathBuf,
    /// Temp files live here until they are renamed into place.
    pub staging: PathBuf,
    /// Where the calling layer parks save data during a reinstall.
    pub backup: PathBuf,
    save_dir_name: String,
    staging_dir_name: String,
}

impl InstallLayout {
    /// Plain-text version of the last completed run.
    pub fn version_file(&self) -> PathBuf {
        self.config.join("version.bin")
    }

    /// Present while a run is applying files.
    pub fn pending_file(&self) -> PathBuf {
        self.config.join("pendingUpdate.bin")
    }

    /// Set when the installation must be wiped and rewritten.
    pub fn reinstall_flag(&self) -> PathBuf {
        self.config.join("forceInstall.flag")
    }

    /// Whether a manifest path falls in an area the plan must never write to.
    /// Names compare case-insensitively, as on a FAT32 card.
    pub fn is_reserved(&self, relative: &str) -> bool {
        let first = relative
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        self.is_save_name(first) || first.eq_ignore_ascii_case(&self.staging_dir_name)
    }

    /// Whether a directory entry name inside the installation is the save area.
    pub fn is_save_name(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.save_dir_name)
    }

    /// Absolute path for a manifest path.
    pub fn target(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.install.clone(), |path, part| path.join(part))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_markers_under_config() {
        let config = UpdaterConfig::default();
        let layout = config.layout(Path::new("/sd"));
        assert_eq!(layout.install, PathBuf::from("/sd/CTGP-7"));
        assert_eq!(
            layout.version_file(),
            PathBuf::from("/sd/CTGP-7/config/version.bin")
        );
        assert_eq!(layout.backup, PathBuf::from("/sd/CTGP-7savebak"));
        assert_eq!(
            layout.target("romfs/Course/a.szs"),
            PathBuf::from("/sd/CTGP-7/romfs/Course/a.szs")
        );
    }

    #[test]
    fn save_and_staging_areas_are_reserved() {
        let layout = UpdaterConfig::default().layout(Path::new("/sd"));
        assert!(layout.is_reserved("savefs/game/save.bin"));
        assert!(layout.is_reserved("staging/tmp"));
        assert!(!layout.is_reserved("config/settings.ini"));
        assert!(!layout.is_reserved("savefs2/other"));
        assert!(layout.is_reserved("SaveFS/game/save.bin"));
        assert!(layout.is_reserved("STAGING/tmp"));
        assert!(layout.is_save_name("SAVEFS"));
        assert!(!layout.is_save_name("config"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updater.json");
        std::fs::write(
            &path,
            r#"{"cdn_candidates":[{"kind":"direct","url":"http://localhost:9000"}],"space_reserve_bytes":1}"#,
        )
        .unwrap();

        let config = UpdaterConfig::load(&path).unwrap();
        assert_eq!(
            config.cdn_candidates,
            vec![CdnCandidate::Direct("http://localhost:9000".into())]
        );
        assert_eq!(config.space_reserve_bytes, 1);
        assert_eq!(config.install_dir, "CTGP-7");
    }
}
