use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::util::hash::{ContentHash, hash_bytes};

use super::{ContentStore, StoreError};

/// Process-local store, used for cold/warm cache tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
  blobs: Mutex<BTreeMap<ContentHash, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.blobs.lock().map(|b| b.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Insert bytes without verifying the key. Only useful to simulate corruption.
  #[cfg(test)]
  pub fn insert_unchecked(&self, hash: ContentHash, bytes: Vec<u8>) {
    if let Ok(mut blobs) = self.blobs.lock() {
      blobs.insert(hash, bytes);
    }
  }
}

impl ContentStore for MemoryStore {
  fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
    let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    match blobs.get(hash) {
      Some(bytes) if hash_bytes(bytes) == *hash => Ok(Some(bytes.clone())),
      Some(_) => {
        blobs.remove(hash);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  fn put(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), StoreError> {
    let actual = hash_bytes(bytes);
    if actual != *hash {
      return Err(StoreError::KeyMismatch {
        expected: hash.clone(),
        actual,
      });
    }
    let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    blobs.insert(hash.clone(), bytes.to_vec());
    Ok(())
  }

  fn contains(&self, hash: &ContentHash) -> bool {
    self.blobs.lock().map(|b| b.contains_key(hash)).unwrap_or(false)
  }

  fn remove(&self, hash: &ContentHash) -> Result<bool, StoreError> {
    let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.remove(hash).is_some())
  }

  fn keys(&self) -> Result<Vec<ContentHash>, StoreError> {
    let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
    Ok(blobs.keys().cloned().collect())
  }
}
