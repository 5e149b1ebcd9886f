//! Durable last-known session state.
//!
//! One JSON file, replaced atomically on every write. Several client
//! processes may share it, so writers hold an exclusive advisory lock on a
//! sibling `.lock` file and readers a shared one. The store only feeds the
//! cold-start display; any failure degrades to the default state.

use crate::error::StoreError;
use crate::state::SessionState;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted state, or `(Disconnected, None)` if there is none or
    /// it cannot be used.
    pub fn read(&self) -> SessionState {
        match self.try_read() {
            Ok(Some(state)) => state,
            Ok(None) => SessionState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring persisted session state: {}", e);
                SessionState::default()
            }
        }
    }

    /// Like [`read`](Self::read) but reports why the file was unusable.
    /// `Ok(None)` means there is no file yet.
    pub fn try_read(&self) -> Result<Option<SessionState>, StoreError> {
        let lock = match self.open_lock(false) {
            Ok(lock) => lock,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        FileExt::lock_shared(&lock)?;

        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: SessionState = serde_json::from_slice(&contents)?;
        if !state.is_consistent() {
            return Err(StoreError::Inconsistent);
        }
        Ok(Some(state))
    }

    /// Atomically replace the stored state.
    pub fn write(&self, state: &SessionState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_vec_pretty(state)?;

        let lock = self.open_lock(true)?;
        FileExt::lock_exclusive(&lock)?;

        let tmp_path = sibling(&self.path, &format!("{}.tmp", std::process::id()));
        let result = write_synced(&tmp_path, &contents).and_then(|_| fs::rename(&tmp_path, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(path = %self.path.display(), status = %state.status(), "Persisted session state");
        Ok(())
    }

    fn open_lock(&self, create: bool) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&self.lock_path)
    }
}

fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tether_ipc::ConnectionStatus;

    #[test]
    fn test_missing_file_reads_default() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        assert_eq!(store.try_read().unwrap(), None);
        assert_eq!(store.read(), SessionState::default());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        let state = SessionState::new(ConnectionStatus::Connected, Some("srv1".into()));

        store.write(&state).unwrap();
        assert_eq!(store.read(), state);

        let replaced = SessionState::new(ConnectionStatus::Error("auth failed".into()), None);
        store.write(&replaced).unwrap();
        assert_eq!(store.read(), replaced);
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.write(&SessionState::default()).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["state.json", "state.json.lock"]);
    }

    #[test]
    fn test_corrupt_file_reads_default() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.write(&SessionState::default()).unwrap();
        fs::write(store.path(), b"{\"status\": ").unwrap();

        assert!(matches!(store.try_read(), Err(StoreError::Json(_))));
        assert_eq!(store.read(), SessionState::default());
    }

    #[test]
    fn test_inconsistent_file_reads_default() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.write(&SessionState::default()).unwrap();
        fs::write(
            store.path(),
            br#"{"status":"Disconnected","server_name":"srv1"}"#,
        )
        .unwrap();

        assert!(matches!(store.try_read(), Err(StoreError::Inconsistent)));
        assert_eq!(store.read(), SessionState::default());
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let states = [
            SessionState::new(ConnectionStatus::Connected, Some("alpha".repeat(200))),
            SessionState::new(ConnectionStatus::Reconnecting, Some("beta".repeat(300))),
        ];

        let writers: Vec<_> = states
            .iter()
            .cloned()
            .map(|state| {
                let store = StateStore::new(&path);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.write(&state).unwrap();
                    }
                })
            })
            .collect();

        let reader = StateStore::new(&path);
        for _ in 0..100 {
            if let Some(state) = reader.try_read().unwrap() {
                assert!(states.contains(&state));
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
    }
}
