use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};

/// What the manifest wants done with a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Add,
    Replace,
    Remove,
}

/// One file in a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the installation directory, `/` separated.
    pub path: String,
    /// Expected size in bytes. Optional for removals.
    #[serde(default)]
    pub size: Option<u64>,
    /// Expected SHA-256 digest (hex encoded). Optional for removals.
    #[serde(default)]
    pub sha256: Option<String>,
    pub action: FileAction,
}

impl FileEntry {
    /// Size of an incoming file; zero for removals.
    pub fn incoming_size(&self) -> u64 {
        match self.action {
            FileAction::Remove => 0,
            _ => self.size.unwrap_or(0),
        }
    }

    /// Lowercase digest, if present.
    pub fn digest(&self) -> Option<String> {
        self.sha256.as_deref().map(|s| s.trim().to_ascii_lowercase())
    }
}

/// File set of the latest release, as published on the CDN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionManifest {
    /// Semantic version string for the release.
    pub version: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl VersionManifest {
    /// Decode and validate a manifest payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: VersionManifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse the semantic version contained in the manifest.
    pub fn parsed_version(&self) -> Result<semver::Version> {
        semver::Version::parse(self.version.trim())
            .map_err(|err| UpdateError::manifest(format!("invalid version {:?}: {err}", self.version)))
    }

    fn validate(&self) -> Result<()> {
        self.parsed_version()?;
        for entry in &self.files {
            validate_path(&entry.path)?;
            if entry.action == FileAction::Remove {
                continue;
            }
            if entry.size.is_none() {
                return Err(UpdateError::manifest(format!("{} has no size", entry.path)));
            }
            match entry.digest() {
                Some(digest) if digest.len() == 64 && hex::decode(&digest).is_ok() => {}
                Some(_) => {
                    return Err(UpdateError::manifest(format!(
                        "{} has a malformed sha256",
                        entry.path
                    )))
                }
                None => {
                    return Err(UpdateError::manifest(format!("{} has no sha256", entry.path)))
                }
            }
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<()> {
    let unsafe_path = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.contains(':')
        || path.split('/').any(|part| part == ".." || part == ".");
    if unsafe_path {
        return Err(UpdateError::manifest(format!("unsafe file path {path:?}")));
    }
    Ok(())
}
