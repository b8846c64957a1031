//! Content-addressed blob stores.
//!
//! Fetched toolchain archives and registry packages are cached by the sha256
//! of their bytes. The store is an explicit value passed into the toolchain
//! resolver and the vendoring layer, so callers decide between the on-disk
//! cache and an in-memory (or empty) one.
//!
//! # Layout
//!
//! ```text
//! <cache>/.lock                # cache-wide lock, see [`lock::CacheLock`]
//! <cache>/store/
//! ├── blobs/<sha256>          # immutable blob contents
//! ├── locks/<sha256>.lock     # per-key write locks
//! └── tmp/                    # partial writes, renamed into blobs/
//! ```

mod disk;
pub mod lock;
mod memory;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::util::hash::ContentHash;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
  /// Bytes handed to `put` do not hash to the key they are stored under.
  #[error("refusing to store blob under {expected}: content hashes to {actual}")]
  KeyMismatch { expected: ContentHash, actual: ContentHash },

  #[error("failed to create directory '{path}': {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read blob '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write blob '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to remove blob '{path}': {source}")]
  Remove {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Lock(#[from] lock::LockError),

  #[error("write of blob {0} did not complete")]
  Interrupted(ContentHash),
}

/// A keyed, content-addressed blob store.
///
/// Implementations must only ever return bytes whose sha256 equals the key:
/// a corrupted entry is reported as a miss, never handed back.
pub trait ContentStore: Send + Sync {
  /// Look up a blob by its content hash.
  fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError>;

  /// Store a blob under its content hash. Writes to the same key serialize.
  fn put(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), StoreError>;

  /// Whether a blob is present (without verifying its content).
  fn contains(&self, hash: &ContentHash) -> bool;

  /// Remove a blob, returning whether it existed.
  fn remove(&self, hash: &ContentHash) -> Result<bool, StoreError>;

  /// All keys currently present, sorted.
  fn keys(&self) -> Result<Vec<ContentHash>, StoreError>;
}

/// `put` on the blocking pool; the write may wait on a key lock and fsync.
/// Hands `bytes` back once stored.
pub async fn put_blocking(
  store: &Arc<dyn ContentStore>,
  hash: &ContentHash,
  bytes: Vec<u8>,
) -> Result<Vec<u8>, StoreError> {
  let store = Arc::clone(store);
  let key = hash.clone();
  tokio::task::spawn_blocking(move || store.put(&key, &bytes).map(|()| bytes))
    .await
    .map_err(|_| StoreError::Interrupted(hash.clone()))?
}
