//! Store files on disk and their SQLite sidecars.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Suffixes SQLite appends to the store path for its side files.
pub const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Sidecar paths for a store file, whether or not they exist.
pub fn sidecar_paths(store: &Path) -> Vec<PathBuf> {
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name = store.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect()
}

/// Delete the store file and its sidecars. Missing files are skipped.
/// Returns the paths that were actually removed.
pub fn remove_store_files(store: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    let mut paths = vec![store.to_path_buf()];
    paths.extend(sidecar_paths(store));

    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed {}", path.display());
                removed.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_paths() {
        let paths = sidecar_paths(Path::new("/data/Kern.sqlite"));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/data/Kern.sqlite-wal"),
                PathBuf::from("/data/Kern.sqlite-shm"),
                PathBuf::from("/data/Kern.sqlite-journal"),
            ]
        );
    }

    #[test]
    fn test_remove_store_files() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("app.sqlite");
        std::fs::write(&store, b"db").unwrap();
        std::fs::write(dir.path().join("app.sqlite-wal"), b"wal").unwrap();
        std::fs::write(dir.path().join("app.sqlite-shm"), b"shm").unwrap();
        std::fs::write(dir.path().join("other.sqlite"), b"keep").unwrap();

        let removed = remove_store_files(&store).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(!store.exists());
        assert!(!dir.path().join("app.sqlite-wal").exists());
        assert!(dir.path().join("other.sqlite").exists());

        // Second pass has nothing left to do.
        assert!(remove_store_files(&store).unwrap().is_empty());
    }
}
