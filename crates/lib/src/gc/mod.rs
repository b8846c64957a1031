//! Cache garbage collection.
//!
//! Three sweeps over the cache root:
//! - toolchains: unpacked directories not named by a current toolchain pin,
//!   or without a valid completion marker
//! - store: blobs whose hash is neither a pin `sha256` nor a `Cargo.lock`
//!   checksum
//! - builds: entries without a valid completion marker
//!
//! Completed build entries are kept; they are keyed by derivation and cannot
//! be traced back to a pin without rebuilding the key.
//!
//! A collection holds the cache lock exclusively and fails while any build
//! holds it. Dot-prefixed staging directories and lock files are never swept.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::build::cache::{LOCKS_DIR, verify_entry};
use crate::pins::{PinFile, PinKind};
use crate::store::lock::{CacheLock, LockError, LockMode};
use crate::store::{ContentStore, DiskStore, StoreError};
use crate::toolchain::{read_marker, toolchain_dir};
use crate::util::hash::ContentHash;
use crate::vendor::Lockfile;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("failed to read cache directory {path}: {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] LockError),
}

/// What must survive a collection.
#[derive(Debug, Default, Clone)]
pub struct GcRoots {
  toolchain_dirs: HashSet<PathBuf>,
  blobs: HashSet<ContentHash>,
}

impl GcRoots {
  /// Roots of one project: its pins and, when present, its lock file.
  pub fn from_project(pins: &PinFile, lock: Option<&Lockfile>, toolchains_dir: &Path) -> Self {
    let mut roots = Self::default();
    for record in pins.pins.values() {
      let Some(sha256) = &record.sha256 else {
        continue;
      };
      if record.kind == PinKind::Toolchain {
        roots
          .toolchain_dirs
          .insert(toolchain_dir(toolchains_dir, &record.label, sha256));
      }
      roots.blobs.insert(sha256.clone());
    }
    if let Some(lock) = lock {
      roots.blobs.extend(lock.checksums().cloned());
    }
    debug!(
      toolchains = roots.toolchain_dirs.len(),
      blobs = roots.blobs.len(),
      "collected gc roots"
    );
    roots
  }

  pub fn keeps_blob(&self, hash: &ContentHash) -> bool {
    self.blobs.contains(hash)
  }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct GcStats {
  pub toolchains_scanned: usize,
  pub toolchains_deleted: usize,
  pub toolchains_bytes_freed: u64,
  pub blobs_scanned: usize,
  pub blobs_deleted: usize,
  pub blobs_bytes_freed: u64,
  pub builds_scanned: usize,
  pub builds_deleted: usize,
  pub builds_bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.toolchains_deleted + self.blobs_deleted + self.builds_deleted
  }

  pub fn total_bytes_freed(&self) -> u64 {
    self.toolchains_bytes_freed + self.blobs_bytes_freed + self.builds_bytes_freed
  }
}

#[derive(Debug, serde::Serialize)]
pub struct GcResult {
  pub dry_run: bool,
  pub stats: GcStats,
  pub deleted_paths: Vec<PathBuf>,
}

/// Collect garbage under `cache_root` (the layout of `pipeline::Caches::at`).
///
/// With `dry_run`, nothing is deleted but the result reports what would be.
pub fn collect_garbage(cache_root: &Path, roots: &GcRoots, dry_run: bool) -> Result<GcResult, GcError> {
  let mode = if dry_run { LockMode::Shared } else { LockMode::Exclusive };
  let _lock = CacheLock::acquire(cache_root, mode, "gc")?;

  let mut stats = GcStats::default();
  let mut deleted_paths = Vec::new();

  let toolchains = cache_root.join("toolchains");
  if toolchains.exists() {
    for path in subdirs(&toolchains)? {
      stats.toolchains_scanned += 1;
      if roots.toolchain_dirs.contains(&path) && read_marker(&path).is_some() {
        continue;
      }
      debug!(path = %path.display(), "removing unreferenced toolchain");
      if let Some(size) = remove_dir(&path, dry_run) {
        stats.toolchains_deleted += 1;
        stats.toolchains_bytes_freed += size;
        deleted_paths.push(path);
      }
    }
  }

  let store = DiskStore::new(cache_root.join("store"));
  for hash in store.keys()? {
    stats.blobs_scanned += 1;
    if roots.keeps_blob(&hash) {
      continue;
    }
    let size = store.blob_size(&hash).unwrap_or(0);
    debug!(hash = %hash.short(), size, "removing unreferenced blob");
    if dry_run || store.remove(&hash)? {
      stats.blobs_deleted += 1;
      stats.blobs_bytes_freed += size;
      deleted_paths.push(store.root().join("blobs").join(hash.as_str()));
    }
  }

  let builds = cache_root.join("builds");
  if builds.exists() {
    for path in subdirs(&builds)? {
      if path.file_name().is_some_and(|name| name == LOCKS_DIR) {
        continue;
      }
      stats.builds_scanned += 1;
      if verify_entry(&path).is_some() {
        continue;
      }
      debug!(path = %path.display(), "removing incomplete build");
      if let Some(size) = remove_dir(&path, dry_run) {
        stats.builds_deleted += 1;
        stats.builds_bytes_freed += size;
        deleted_paths.push(path);
      }
    }
  }

  info!(
    toolchains_deleted = stats.toolchains_deleted,
    blobs_deleted = stats.blobs_deleted,
    builds_deleted = stats.builds_deleted,
    bytes_freed = stats.total_bytes_freed(),
    dry_run,
    "garbage collection complete"
  );

  Ok(GcResult {
    dry_run,
    stats,
    deleted_paths,
  })
}

/// Sorted subdirectories of `dir`, without dot-prefixed staging directories.
fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, GcError> {
  let entries = fs::read_dir(dir).map_err(|source| GcError::ReadDir {
    path: dir.to_path_buf(),
    source,
  })?;
  let mut dirs: Vec<PathBuf> = entries
    .flatten()
    .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
    .map(|e| e.path())
    .filter(|p| p.is_dir())
    .collect();
  dirs.sort();
  Ok(dirs)
}

fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

/// Remove `path`, returning the bytes freed. `None` when deletion failed.
fn remove_dir(path: &Path, dry_run: bool) -> Option<u64> {
  let size = dir_size(path);
  if dry_run {
    return Some(size);
  }
  match fs::remove_dir_all(path) {
    Ok(()) => Some(size),
    Err(e) => {
      warn!(path = %path.display(), error = %e, "failed to delete cache directory");
      None
    }
  }
}
