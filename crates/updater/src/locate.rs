use std::path::{Path, PathBuf};

/// Directory every 3DS creates at the root of its SD card.
pub const SD_CARD_MARKER: &str = "Nintendo 3DS";

/// First candidate that looks like a 3DS SD card root.
pub fn find_install_root<I, P>(candidates: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    candidates
        .into_iter()
        .map(|p| p.as_ref().to_path_buf())
        .find(|p| looks_like_sd_root(p))
}

pub fn looks_like_sd_root(path: &Path) -> bool {
    path.join(SD_CARD_MARKER).is_dir()
}

/// Mount points where removable media usually shows up on this platform.
pub fn default_candidates() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        (b'A'..=b'Z')
            .map(|letter| PathBuf::from(format!("{}:\\", letter as char)))
            .collect()
    }

    #[cfg(not(windows))]
    {
        let mut parents = vec![PathBuf::from("/Volumes"), PathBuf::from("/mnt")];
        if let Ok(user) = std::env::var("USER") {
            parents.push(PathBuf::from("/media").join(&user));
            parents.push(PathBuf::from("/run/media").join(&user));
        }
        parents
            .iter()
            .filter_map(|parent| std::fs::read_dir(parent).ok())
            .flat_map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_first_card_like_candidate() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let c = tempfile::tempdir().unwrap();
        std::fs::create_dir(b.path().join(SD_CARD_MARKER)).unwrap();
        std::fs::create_dir(c.path().join(SD_CARD_MARKER)).unwrap();

        let found = find_install_root([a.path(), b.path(), c.path()]);
        assert_eq!(found.as_deref(), Some(b.path()));
        assert_eq!(find_install_root([a.path()]), None);
    }
}
