//! Persistent upload URL store.
//!
//! Maps an upload fingerprint to the upload URL the server created for it,
//! so an interrupted upload can be resumed by a later process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::debug;

/// Errors from the URL store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identifies one (file, endpoint) pair across processes.
///
/// A file that changes size or modification time gets a new fingerprint,
/// so a stale upload URL is never resumed with different bytes.
pub fn fingerprint(path: &Path, size: u64, modified: Option<SystemTime>, endpoint: &str) -> String {
    let modified = modified
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis());

    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(size.to_le_bytes());
    hasher.update(modified.to_le_bytes());
    hasher.update(endpoint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Upload URLs keyed by fingerprint, cached in memory and persisted as JSON.
pub struct UrlStore {
    path: PathBuf,
    urls: RwLock<HashMap<String, String>>,
}

impl UrlStore {
    /// Opens the store, loading existing entries from disk.
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let urls = load_urls(&path)?;
        Ok(Self {
            path,
            urls: RwLock::new(urls),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the upload URL stored for a fingerprint, if any.
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        self.read().get(fingerprint).cloned()
    }

    pub fn save(&self, fingerprint: &str, upload_url: &str) -> Result<(), StoreError> {
        self.write()
            .insert(fingerprint.to_string(), upload_url.to_string());
        self.persist()
    }

    /// Removes an entry. Removing a missing entry is not an error.
    pub fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        if self.write().remove(fingerprint).is_none() {
            return Ok(());
        }
        self.persist()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let map = self.read();
        let json = serde_json::to_string_pretty(&*map)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!(entries = map.len(), path = ?self.path, "persisted upload URLs");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.urls.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.urls.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_urls(path: &Path) -> Result<HashMap<String, String>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let urls: HashMap<String, String> = serde_json::from_str(&data)?;
    debug!(entries = urls.len(), path = ?path, "loaded upload URLs");
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_store() -> (tempfile::TempDir, UrlStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = UrlStore::new(tmp.path().join("uploads.json")).unwrap();
        (tmp, store)
    }

    #[test]
    fn new_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.fingerprints().is_empty());
        assert!(store.get("abc").is_none());
    }

    #[test]
    fn save_get_remove() {
        let (_tmp, store) = test_store();
        store.save("fp-1", "http://localhost/files/1").unwrap();
        assert_eq!(store.get("fp-1").unwrap(), "http://localhost/files/1");

        store.remove("fp-1").unwrap();
        assert!(store.get("fp-1").is_none());
        store.remove("fp-1").unwrap();
    }

    #[test]
    fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("uploads.json");

        {
            let store = UrlStore::new(path.clone()).unwrap();
            store.save("a", "http://localhost/files/a").unwrap();
            store.save("b", "http://localhost/files/b").unwrap();
        }

        let reloaded = UrlStore::new(path).unwrap();
        let mut fps = reloaded.fingerprints();
        fps.sort();
        assert_eq!(fps, vec!["a", "b"]);
        assert_eq!(reloaded.get("b").unwrap(), "http://localhost/files/b");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("uploads.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(UrlStore::new(path), Err(StoreError::Json(_))));
    }

    #[test]
    fn fingerprint_is_stable() {
        let path = Path::new("/data/video.mp4");
        let when = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = fingerprint(path, 10, Some(when), "http://localhost/files/");
        let b = fingerprint(path, 10, Some(when), "http://localhost/files/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_inputs() {
        let path = Path::new("/data/video.mp4");
        let when = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let base = fingerprint(path, 10, Some(when), "http://localhost/files/");

        assert_ne!(base, fingerprint(path, 11, Some(when), "http://localhost/files/"));
        assert_ne!(base, fingerprint(path, 10, None, "http://localhost/files/"));
        assert_ne!(base, fingerprint(path, 10, Some(when), "http://other/files/"));
        assert_ne!(
            base,
            fingerprint(Path::new("/data/other.mp4"), 10, Some(when), "http://localhost/files/")
        );
    }
}
