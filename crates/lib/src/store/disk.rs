use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::platform::paths::store_dir;
use crate::util::hash::{ContentHash, hash_bytes};

use super::lock::KeyLock;
use super::{ContentStore, StoreError};

/// On-disk content-addressed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
  root: PathBuf,
}

impl Default for DiskStore {
  fn default() -> Self {
    Self::new(store_dir())
  }
}

impl DiskStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn blob_path(&self, hash: &ContentHash) -> PathBuf {
    self.root.join("blobs").join(hash.as_str())
  }

  fn locks_dir(&self) -> PathBuf {
    self.root.join("locks")
  }

  fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|source| StoreError::CreateDir {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Size in bytes of a stored blob, if present.
  pub fn blob_size(&self, hash: &ContentHash) -> Option<u64> {
    fs::metadata(self.blob_path(hash)).ok().map(|m| m.len())
  }
}

impl ContentStore for DiskStore {
  fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
    let path = self.blob_path(hash);
    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(StoreError::Read { path, source }),
    };

    let actual = hash_bytes(&bytes);
    if actual != *hash {
      warn!(
        path = %path.display(),
        expected = %hash,
        actual = %actual,
        "cached blob corrupted, discarding"
      );
      self.remove(hash)?;
      return Ok(None);
    }

    debug!(hash = %hash.short(), "store hit");
    Ok(Some(bytes))
  }

  fn put(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), StoreError> {
    let actual = hash_bytes(bytes);
    if actual != *hash {
      return Err(StoreError::KeyMismatch {
        expected: hash.clone(),
        actual,
      });
    }

    let _lock = KeyLock::acquire(&self.locks_dir(), hash.as_str(), "store-put")?;

    let dest = self.blob_path(hash);
    if dest.exists() {
      // Another writer finished first; the key guarantees identical content.
      return Ok(());
    }

    let blobs = self.root.join("blobs");
    let tmp = self.root.join("tmp");
    Self::ensure_dir(&blobs)?;
    Self::ensure_dir(&tmp)?;

    let write_err = |source| StoreError::Write {
      path: dest.clone(),
      source,
    };
    let mut file = tempfile::NamedTempFile::new_in(&tmp).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.as_file().sync_all().map_err(write_err)?;
    file.persist(&dest).map_err(|e| write_err(e.error))?;

    debug!(hash = %hash.short(), size = bytes.len(), "stored blob");
    Ok(())
  }

  fn contains(&self, hash: &ContentHash) -> bool {
    self.blob_path(hash).is_file()
  }

  fn remove(&self, hash: &ContentHash) -> Result<bool, StoreError> {
    let path = self.blob_path(hash);
    match fs::remove_file(&path) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(source) => Err(StoreError::Remove { path, source }),
    }
  }

  fn keys(&self) -> Result<Vec<ContentHash>, StoreError> {
    let blobs = self.root.join("blobs");
    let entries = match fs::read_dir(&blobs) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => return Err(StoreError::Read { path: blobs, source }),
    };

    let mut keys: Vec<ContentHash> = entries
      .filter_map(|entry| entry.ok())
      .filter_map(|entry| entry.file_name().to_str().and_then(ContentHash::parse))
      .collect();
    keys.sort();
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn put_then_get_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = DiskStore::new(temp.path());
    let hash = hash_bytes(b"package bytes");

    assert!(store.get(&hash).unwrap().is_none());
    store.put(&hash, b"package bytes").unwrap();

    assert!(store.contains(&hash));
    assert_eq!(store.get(&hash).unwrap().unwrap(), b"package bytes");
    assert_eq!(store.keys().unwrap(), vec![hash.clone()]);
    assert_eq!(store.blob_size(&hash), Some(13));
  }

  #[test]
  fn put_rejects_mismatched_key() {
    let temp = TempDir::new().unwrap();
    let store = DiskStore::new(temp.path());

    let result = store.put(&hash_bytes(b"expected"), b"actual");
    assert!(matches!(result, Err(StoreError::KeyMismatch { .. })));
    assert!(store.keys().unwrap().is_empty());
  }

  #[test]
  fn corrupted_blob_is_discarded() {
    let temp = TempDir::new().unwrap();
    let store = DiskStore::new(temp.path());
    let hash = hash_bytes(b"original");
    store.put(&hash, b"original").unwrap();

    fs::write(temp.path().join("blobs").join(hash.as_str()), b"tampered").unwrap();

    assert!(store.get(&hash).unwrap().is_none());
    assert!(!store.contains(&hash));
  }

  #[test]
  fn keys_ignores_foreign_files() {
    let temp = TempDir::new().unwrap();
    let store = DiskStore::new(temp.path());
    fs::create_dir_all(temp.path().join("blobs")).unwrap();
    fs::write(temp.path().join("blobs/README"), "not a blob").unwrap();

    assert!(store.keys().unwrap().is_empty());
  }

  #[test]
  fn concurrent_writers_of_same_key() {
    let temp = TempDir::new().unwrap();
    let store = std::sync::Arc::new(DiskStore::new(temp.path()));
    let data = vec![7u8; 64 * 1024];
    let hash = hash_bytes(&data);

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let store = store.clone();
        let data = data.clone();
        let hash = hash.clone();
        std::thread::spawn(move || store.put(&hash, &data))
      })
      .collect();
    for handle in handles {
      handle.join().unwrap().unwrap();
    }

    assert_eq!(store.get(&hash).unwrap().unwrap(), data);
  }
}
