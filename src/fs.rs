//! Scoped working-directory helpers, grounded on the teacher's `fs::workspace_directory` and the
//! atomic write-to-temp-then-rename pattern used throughout the example pack for config files
//! that must never be observed half-written.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Creates `{root}/recipe-invocations/{invocation_id}` with `0700` permissions and returns it.
/// Mirrors the teacher's `workspace_directory`, scoped to a single recipe invocation rather than
/// a whole deployment.
pub fn create_invocation_dir(root: &Path, invocation_id: &str) -> io::Result<PathBuf> {
    let dir = root.join("recipe-invocations").join(invocation_id);
    fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir)
}

/// Removes the invocation's scratch directory. Called on every exit path (success, error, or
/// cancellation). Missing directories are not an error: the caller may have already cleaned up,
/// or creation may never have succeeded.
pub fn remove_invocation_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Writes `contents` to `path` atomically: write to a sibling `.tmp` file, `fsync`, then rename
/// over the destination. Used by the Config Synthesizer (C4) and the lock-marker write in the
/// Binary Installer (C2) so a concurrent reader never observes a partial file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp"),
        std::process::id()
    ));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let mut file = fs::File::create(&tmp_path)?;
        use std::io::Write;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_and_removes_scoped_dir() {
        let root = tempdir().unwrap();
        let dir = create_invocation_dir(root.path(), "inv-1").unwrap();
        assert!(dir.exists());

        remove_invocation_dir(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn removing_missing_dir_is_not_an_error() {
        let root = tempdir().unwrap();
        let missing = root.path().join("does-not-exist");
        assert!(remove_invocation_dir(&missing).is_ok());
    }

    #[test]
    fn atomic_write_never_leaves_a_tmp_file_behind() {
        let root = tempdir().unwrap();
        let path = root.path().join("main.tf.json");
        atomic_write(&path, b"{}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        let leftovers: Vec<_> = fs::read_dir(root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
