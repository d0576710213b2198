//! Classification of an existing installation from its marker files.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{InstallLayout, UpdaterConfig};
use crate::error::{Result, UpdateError};

const NOT_INSTALLED: u8 = 1;
const NO_VERSION: u8 = 2;
const PENDING: u8 = 4;
const FORCE_REINSTALL: u8 = 8;

/// What is on the card right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallationState {
    /// No installation directory.
    Absent,
    /// Installed with a readable version marker.
    Valid,
    /// A previous run stopped between download and full apply.
    PendingUpdate,
    /// The installation directory exists but its version marker does not.
    Corrupted,
    /// Flagged for forced reinstall, or not a directory at all.
    Broken,
}

impl InstallationState {
    /// Whether a fresh install (wipe and rewrite) is the right next step.
    pub fn needs_install(&self) -> bool {
        matches!(self, Self::Absent | Self::Corrupted | Self::Broken)
    }
}

/// Read the markers under `root` and classify them.
pub fn inspect(root: &Path, config: &UpdaterConfig) -> Result<InstallationState> {
    let meta = fs::metadata(root).map_err(|err| UpdateError::fs(root, err))?;
    if !meta.is_dir() {
        return Err(UpdateError::fs(
            root,
            std::io::Error::new(ErrorKind::InvalidInput, "target root is not a directory"),
        ));
    }
    fs::read_dir(root).map_err(|err| UpdateError::fs(root, err))?;

    let layout = config.layout(root);
    let bits = marker_bits(&layout)?;
    Ok(classify(bits))
}

/// Installed version, if the version marker is present and well formed.
pub fn installed_version(root: &Path, config: &UpdaterConfig) -> Option<semver::Version> {
    read_version(&config.layout(root)).ok().flatten()
}

fn marker_bits(layout: &InstallLayout) -> Result<u8> {
    let mut bits = 0;
    match fs::metadata(&layout.install) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(FORCE_REINSTALL),
        Err(err) if err.kind() == ErrorKind::NotFound => bits |= NOT_INSTALLED,
        Err(err) => return Err(UpdateError::fs(&layout.install, err)),
    }
    if read_version(layout)?.is_none() {
        bits |= NO_VERSION;
    }
    if exists(&layout.pending_file())? {
        bits |= PENDING;
    }
    if exists(&layout.reinstall_flag())? {
        bits |= FORCE_REINSTALL;
    }
    Ok(bits)
}

fn classify(bits: u8) -> InstallationState {
    if bits & (NOT_INSTALLED | NO_VERSION) == NO_VERSION {
        InstallationState::Corrupted
    } else if bits & FORCE_REINSTALL != 0 {
        InstallationState::Broken
    } else if bits & NOT_INSTALLED != 0 {
        InstallationState::Absent
    } else if bits & PENDING != 0 {
        InstallationState::PendingUpdate
    } else {
        InstallationState::Valid
    }
}

fn read_version(layout: &InstallLayout) -> Result<Option<semver::Version>> {
    let path = layout.version_file();
    match fs::read(&path) {
        Ok(raw) => Ok(std::str::from_utf8(&raw)
            .ok()
            .and_then(|text| semver::Version::parse(text.trim()).ok())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(UpdateError::fs(path, err)),
    }
}

fn exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(UpdateError::fs(path, err)),
    }
}
