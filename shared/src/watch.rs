//! Modification-time polling for hot-reloaded files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Reports when a file's modification time moves.
///
/// A file that disappears is not a change; a file that appears after being
/// absent is.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl FileWatcher {
    /// Start watching from the file's current state.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the modification time differs from the last poll.
    pub fn poll(&mut self) -> bool {
        let Some(current) = modified(&self.path) else {
            return false;
        };
        if self.last_modified == Some(current) {
            return false;
        }
        self.last_modified = Some(current);
        true
    }

    /// Contents of the file if it changed since the last poll.
    pub fn read_if_changed(&mut self) -> Option<String> {
        if self.poll() {
            fs::read_to_string(&self.path).ok()
        } else {
            None
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(path: &Path, at: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    #[test]
    fn reports_each_modification_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.txt");
        fs::write(&path, "a.exe\n").unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        touch(&path, base);

        let mut watcher = FileWatcher::new(&path);
        assert!(!watcher.poll());

        fs::write(&path, "b.exe\n").unwrap();
        touch(&path, base + Duration::from_secs(5));
        assert_eq!(watcher.read_if_changed().as_deref(), Some("b.exe\n"));
        assert!(!watcher.poll());
    }

    #[test]
    fn missing_file_is_not_a_change_until_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fps_overlay.ini");

        let mut watcher = FileWatcher::new(&path);
        assert!(!watcher.poll());

        fs::write(&path, "[Display]\n").unwrap();
        assert!(watcher.poll());
        assert_eq!(watcher.path(), path);
    }
}
