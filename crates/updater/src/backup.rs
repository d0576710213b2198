//! Save-data backup and restore around a reinstall.
//!
//! The engine never writes into the save area; these helpers are for the
//! calling layer, which moves the save data out of the way before a wipe and
//! offers to put it back afterwards.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::info;

use crate::config::InstallLayout;
use crate::error::{Result, UpdateError};

/// Move the save directory to the backup location, replacing an older backup.
/// Returns `false` when there was nothing to back up.
pub fn backup_save_data(layout: &InstallLayout) -> Result<bool> {
    if !layout.save.is_dir() {
        return Ok(false);
    }
    match fs::remove_dir_all(&layout.backup) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(UpdateError::fs(&layout.backup, err)),
    }
    fs::rename(&layout.save, &layout.backup).map_err(|err| UpdateError::fs(&layout.save, err))?;
    info!(backup = %layout.backup.display(), "save data backed up");
    Ok(true)
}

/// Copy the backup back into the save directory. The backup is kept.
pub fn restore_save_data(layout: &InstallLayout) -> Result<()> {
    if !layout.backup.is_dir() {
        return Err(UpdateError::fs(
            &layout.backup,
            std::io::Error::new(ErrorKind::NotFound, "no save backup found"),
        ));
    }
    copy_tree(&layout.backup, &layout.save)?;
    info!(save = %layout.save.display(), "save data restored");
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|err| UpdateError::fs(to, err))?;
    for entry in fs::read_dir(from).map_err(|err| UpdateError::fs(from, err))? {
        let entry = entry.map_err(|err| UpdateError::fs(from, err))?;
        let source = entry.path();
        let dest = to.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|err| UpdateError::fs(&source, err))?;
        if file_type.is_dir() {
            copy_tree(&source, &dest)?;
        } else {
            fs::copy(&source, &dest).map_err(|err| UpdateError::fs(&source, err))?;
        }
    }
    Ok(())
}
