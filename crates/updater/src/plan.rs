//! Turns a manifest and the current card contents into the list of writes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::InstallLayout;
use crate::error::{Result, UpdateError};
use crate::inspect::InstallationState;
use crate::manifest::{FileAction, FileEntry, VersionManifest};

/// Size and digest of a file already on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub size: u64,
    pub sha256: String,
}

/// Fingerprints of the files a manifest talks about, keyed by manifest path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnDiskFiles {
    files: BTreeMap<String, FileFingerprint>,
}

impl OnDiskFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, fingerprint: FileFingerprint) {
        self.files.insert(path.into(), fingerprint);
    }

    pub fn get(&self, path: &str) -> Option<&FileFingerprint> {
        self.files.get(path)
    }

    /// Fingerprint every manifest path present under the installation.
    /// Removals only need existence and size, so they are not hashed.
    pub fn scan(layout: &InstallLayout, manifest: &VersionManifest) -> Result<Self> {
        let mut on_disk = Self::new();
        for entry in &manifest.files {
            if layout.is_reserved(&entry.path) {
                continue;
            }
            let path = layout.target(&entry.path);
            let meta = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(UpdateError::fs(path, err)),
            };
            let sha256 = match entry.action {
                FileAction::Remove => String::new(),
                _ => sha256_file(&path)?,
            };
            on_disk.insert(
                entry.path.clone(),
                FileFingerprint {
                    size: meta.len(),
                    sha256,
                },
            );
        }
        Ok(on_disk)
    }
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|err| UpdateError::fs(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).map_err(|err| UpdateError::fs(path, err))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One write the executor has to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub path: String,
    pub action: FileAction,
    /// Bytes to download; zero for removals.
    pub size: u64,
    /// Expected digest of the downloaded bytes; `None` for removals.
    pub sha256: Option<String>,
    /// Bytes currently occupied on disk by the path, if any.
    pub existing_size: Option<u64>,
}

/// Ordered work needed to bring an installation to a manifest's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    pub version: String,
    pub entries: Vec<PlannedEntry>,
    /// Sum of Add and Replace sizes.
    pub incoming_bytes: u64,
    /// Bytes freed by Remove entries.
    pub removed_bytes: u64,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Net growth of the installation once fully applied.
    pub fn byte_delta(&self) -> i64 {
        self.incoming_bytes as i64 - self.removed_bytes as i64
    }
}

/// Compute the plan. Entries already matching the manifest are left out and
/// the remaining ones keep manifest order, so re-planning after a partial
/// apply yields exactly the unfinished tail.
pub fn plan(
    current: InstallationState,
    on_disk: &OnDiskFiles,
    manifest: &VersionManifest,
    layout: &InstallLayout,
) -> UpdatePlan {
    let broken = current == InstallationState::Broken;

    let mut entries = Vec::new();
    for entry in &manifest.files {
        if layout.is_reserved(&entry.path) {
            tracing::debug!(path = %entry.path, "skipping reserved path");
            continue;
        }
        let existing = match entry.action {
            // Broken installs get every file rewritten, but a removal only
            // needs to know the file is there.
            FileAction::Add | FileAction::Replace if broken => None,
            _ => on_disk.get(&entry.path),
        };
        if let Some(planned) = plan_entry(entry, existing) {
            entries.push(planned);
        }
    }

    let incoming_bytes = entries.iter().map(|e| e.size).sum();
    let removed_bytes = entries
        .iter()
        .filter(|e| e.action == FileAction::Remove)
        .filter_map(|e| e.existing_size)
        .sum();

    UpdatePlan {
        version: manifest.version.clone(),
        entries,
        incoming_bytes,
        removed_bytes,
    }
}

fn plan_entry(entry: &FileEntry, existing: Option<&FileFingerprint>) -> Option<PlannedEntry> {
    match entry.action {
        FileAction::Remove => existing.map(|found| PlannedEntry {
            path: entry.path.clone(),
            action: FileAction::Remove,
            size: 0,
            sha256: None,
            existing_size: Some(found.size),
        }),
        FileAction::Add | FileAction::Replace => {
            let size = entry.incoming_size();
            let digest = entry.digest();
            let action = match existing {
                Some(found) if found.size == size && Some(&found.sha256) == digest.as_ref() => {
                    return None
                }
                Some(_) => FileAction::Replace,
                None => FileAction::Add,
            };
            Some(PlannedEntry {
                path: entry.path.clone(),
                action,
                size,
                sha256: digest,
                existing_size: existing.map(|found| found.size),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdaterConfig;

    fn digest(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn add(path: &str, data: &[u8]) -> FileEntry {
        FileEntry {
            path: path.into(),
            size: Some(data.len() as u64),
            sha256: Some(digest(data)),
            action: FileAction::Add,
        }
    }

    fn fingerprint(data: &[u8]) -> FileFingerprint {
        FileFingerprint {
            size: data.len() as u64,
            sha256: digest(data),
        }
    }

    fn layout() -> InstallLayout {
        UpdaterConfig::default().layout(Path::new("/sd"))
    }

    fn manifest(files: Vec<FileEntry>) -> VersionManifest {
        VersionManifest {
            version: "1.1.0".into(),
            files,
        }
    }

    #[test]
    fn unchanged_changed_and_new_files() {
        let manifest = manifest(vec![
            add("a.bin", b"same"),
            add("b.bin", b"new contents"),
            add("c.bin", b"brand new"),
        ]);
        let mut on_disk = OnDiskFiles::new();
        on_disk.insert("a.bin", fingerprint(b"same"));
        on_disk.insert("b.bin", fingerprint(b"old contents"));

        let plan = plan(InstallationState::Valid, &on_disk, &manifest, &layout());
        let actions: Vec<_> = plan
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.action))
            .collect();
        assert_eq!(
            actions,
            vec![("b.bin", FileAction::Replace), ("c.bin", FileAction::Add)]
        );
        assert_eq!(plan.incoming_bytes, 12 + 9);
    }

    #[test]
    fn planning_is_idempotent_once_disk_matches() {
        let manifest = manifest(vec![add("a.bin", b"one"), add("b.bin", b"two")]);
        let mut on_disk = OnDiskFiles::new();
        on_disk.insert("a.bin", fingerprint(b"one"));
        on_disk.insert("b.bin", fingerprint(b"two"));

        let plan = plan(InstallationState::Valid, &on_disk, &manifest, &layout());
        assert!(plan.is_empty());
        assert_eq!(plan.byte_delta(), 0);
    }

    #[test]
    fn replan_after_partial_apply_is_the_unwritten_suffix() {
        let files = vec![
            add("1.bin", b"one"),
            add("2.bin", b"two"),
            add("3.bin", b"three"),
            add("4.bin", b"four"),
        ];
        let manifest = manifest(files);
        let full = plan(InstallationState::Absent, &OnDiskFiles::new(), &manifest, &layout());
        assert_eq!(full.len(), 4);

        let mut on_disk = OnDiskFiles::new();
        on_disk.insert("1.bin", fingerprint(b"one"));
        on_disk.insert("2.bin", fingerprint(b"two"));
        let resumed = plan(InstallationState::PendingUpdate, &on_disk, &manifest, &layout());
        assert_eq!(resumed.entries, full.entries[2..].to_vec());
    }

    #[test]
    fn removals_only_when_present() {
        let remove = |path: &str| FileEntry {
            path: path.into(),
            size: None,
            sha256: None,
            action: FileAction::Remove,
        };
        let manifest = manifest(vec![remove("gone.bin"), remove("here.bin")]);
        let mut on_disk = OnDiskFiles::new();
        on_disk.insert(
            "here.bin",
            FileFingerprint {
                size: 40,
                sha256: String::new(),
            },
        );

        let plan = plan(InstallationState::Valid, &on_disk, &manifest, &layout());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].path, "here.bin");
        assert_eq!(plan.removed_bytes, 40);
        assert_eq!(plan.byte_delta(), -40);
    }

    #[test]
    fn save_data_is_never_planned() {
        let manifest = manifest(vec![add("savefs/game.sav", b"blank"), add("a.bin", b"a")]);
        let plan = plan(InstallationState::Absent, &OnDiskFiles::new(), &manifest, &layout());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].path, "a.bin");
    }

    #[test]
    fn broken_install_rewrites_everything() {
        let manifest = manifest(vec![add("a.bin", b"a")]);
        let mut on_disk = OnDiskFiles::new();
        on_disk.insert("a.bin", fingerprint(b"a"));
        let plan = plan(InstallationState::Broken, &on_disk, &manifest, &layout());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].action, FileAction::Add);
    }

    #[test]
    fn broken_install_still_removes_obsolete_files() {
        let manifest = manifest(vec![
            add("a.bin", b"a"),
            FileEntry {
                path: "obsolete.bin".into(),
                size: None,
                sha256: None,
                action: FileAction::Remove,
            },
        ]);
        let mut on_disk = OnDiskFiles::new();
        on_disk.insert("a.bin", fingerprint(b"a"));
        on_disk.insert(
            "obsolete.bin",
            FileFingerprint {
                size: 3,
                sha256: String::new(),
            },
        );

        let plan = plan(InstallationState::Broken, &on_disk, &manifest, &layout());
        let actions: Vec<_> = plan
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e.action))
            .collect();
        assert_eq!(
            actions,
            vec![("a.bin", FileAction::Add), ("obsolete.bin", FileAction::Remove)]
        );
        assert_eq!(plan.removed_bytes, 3);
    }

    #[test]
    fn scan_fingerprints_manifest_paths() {
        let dir = tempfile::tempdir().unwrap();
        let layout = UpdaterConfig::default().layout(dir.path());
        fs::create_dir_all(layout.install.join("romfs")).unwrap();
        fs::write(layout.install.join("romfs/a.bin"), b"same").unwrap();
        fs::write(layout.install.join("stray.bin"), b"not in manifest").unwrap();

        let manifest = manifest(vec![add("romfs/a.bin", b"same"), add("b.bin", b"b")]);
        let on_disk = OnDiskFiles::scan(&layout, &manifest).unwrap();
        assert_eq!(on_disk.get("romfs/a.bin"), Some(&fingerprint(b"same")));
        assert!(on_disk.get("b.bin").is_none());
        assert!(on_disk.get("stray.bin").is_none());
    }
}
