//! Secure key/value storage backends.
//!
//! The credential store only needs three primitives: read one key, write a
//! set of keys atomically and delete a set of keys atomically. Platform
//! keychains satisfy this contract; the backends here cover tests
//! ([`MemoryStorage`]) and desktop/CLI use ([`FileStorage`]).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

/// Durable string storage keyed by name.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write every entry or none of them.
    async fn set_entries(&self, entries: &[(&str, &str)]) -> Result<()>;

    /// Remove every listed key. Missing keys are not an error.
    async fn delete_entries(&self, keys: &[&str]) -> Result<()>;
}

/// Process-local storage. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set_entries(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert((*key).to_owned(), (*value).to_owned());
        }
        Ok(())
    }

    async fn delete_entries(&self, keys: &[&str]) -> Result<()> {
        let mut map = self.entries.lock();
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }
}

/// JSON map on disk, replaced atomically on every write.
///
/// The file is written to a temporary sibling and renamed over the target,
/// so a crash never leaves half a credential behind. On Unix the file is
/// readable by the owner only.
///
/// Each operation runs start to finish on the blocking pool while holding the
/// file lock. Dropping the calling future does not release the lock early.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file_lock: Arc<Mutex<()>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_file<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock = Arc::clone(&self.file_lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            op(&path)
        })
        .await
        .map_err(|e| SessionError::storage(format!("storage task failed: {e}")))?
    }

    /// Read-modify-write. `apply` returns whether the map changed.
    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, String>) -> bool + Send + 'static,
    {
        self.with_file(move |path| {
            let mut map = load_map(path)?;
            if !apply(&mut map) {
                return Ok(());
            }
            write_atomically(path, &map)
        })
        .await
    }
}

fn load_map(path: &Path) -> Result<HashMap<String, String>> {
    match std::fs::read(path) {
        Ok(raw) if raw.is_empty() => Ok(HashMap::new()),
        Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
            SessionError::storage(format!("credential file {} is corrupt: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(SessionError::storage(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

fn write_atomically(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| {
        SessionError::storage(format!("failed to create {}: {e}", parent.display()))
    })?;

    let payload = serde_json::to_vec_pretty(map)
        .map_err(|e| SessionError::storage(format!("failed to encode credentials: {e}")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|e| SessionError::storage(format!("failed to create temp file: {e}")))?;
    tmp.write_all(&payload)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| SessionError::storage(format!("failed to write temp file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = tmp
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
        {
            warn!(error = %e, "Failed to restrict credential file permissions");
        }
    }

    tmp.persist(path).map_err(|e| {
        SessionError::storage(format!("failed to replace {}: {}", path.display(), e.error))
    })?;
    debug!(path = %path.display(), entries = map.len(), "Credential file written");
    Ok(())
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_owned();
        self.with_file(move |path| Ok(load_map(path)?.remove(&key)))
            .await
    }

    async fn set_entries(&self, entries: &[(&str, &str)]) -> Result<()> {
        let entries: Vec<(String, String)> = entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        self.update(move |map| {
            map.extend(entries);
            true
        })
        .await
    }

    async fn delete_entries(&self, keys: &[&str]) -> Result<()> {
        let keys: Vec<String> = keys.iter().map(|key| (*key).to_owned()).collect();
        self.update(move |map| {
            let before = map.len();
            for key in &keys {
                map.remove(key);
            }
            map.len() != before
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_set_and_delete() {
        let storage = MemoryStorage::new();
        storage
            .set_entries(&[("accessToken", "a"), ("refreshToken", "r")])
            .await
            .unwrap();
        assert_eq!(storage.get("accessToken").await.unwrap().as_deref(), Some("a"));
        assert_eq!(storage.len(), 2);

        storage
            .delete_entries(&["accessToken", "refreshToken", "missing"])
            .await
            .unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.json");

        let storage = FileStorage::new(&path);
        assert_eq!(storage.get("accessToken").await.unwrap(), None);
        storage
            .set_entries(&[("accessToken", "a1"), ("refreshToken", "r1")])
            .await
            .unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get("refreshToken").await.unwrap().as_deref(), Some("r1"));

        reopened.delete_entries(&["accessToken"]).await.unwrap();
        assert_eq!(storage.get("accessToken").await.unwrap(), None);
        assert_eq!(storage.get("refreshToken").await.unwrap().as_deref(), Some("r1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_storage_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        FileStorage::new(&path)
            .set_entries(&[("accessToken", "a")])
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = FileStorage::new(&path).get("accessToken").await.unwrap_err();
        assert!(matches!(err, SessionError::StorageFailure { .. }));
    }
}
