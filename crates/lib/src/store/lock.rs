//! Advisory `flock` locks over the cache.
//!
//! Two levels:
//! - [`KeyLock`]: per-key write lock. Two writers of the same blob or build
//!   entry serialize on `<locks>/<key>.lock`; readers never take it.
//! - [`CacheLock`]: cache-wide lock on `<cache>/.lock`. Anything that writes
//!   into the cache holds it shared; garbage collection holds it exclusive.
//!
//! Locks are released when the value drops. A key lock file records who
//! holds it so a stuck writer can be identified.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};

use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Cache-wide lock file, directly under the cache root.
pub const CACHE_LOCK_FILENAME: &str = ".lock";

/// Who holds a key lock.
#[derive(Debug, Serialize, Deserialize)]
pub struct Holder {
  pub pid: u32,
  pub purpose: String,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("failed to open lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock {path}: {source}")]
  Flock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cache {root} is in use by a running build; retry once it finishes")]
  Busy { root: PathBuf },
}

/// How a [`CacheLock`] is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

pub struct KeyLock {
  file: File,
  path: PathBuf,
}

impl KeyLock {
  /// Block until this process holds the lock for `key`.
  pub fn acquire(dir: &Path, key: &str, purpose: &str) -> Result<Self, LockError> {
    let path = dir.join(format!("{key}.lock"));
    let open_err = |source| LockError::Open {
      path: path.clone(),
      source,
    };
    fs::create_dir_all(dir).map_err(open_err)?;
    let file = open_lock_file(&path).map_err(open_err)?;

    trace!(key, purpose, "waiting for key lock");
    flock(&file, &path, FlockOperation::LockExclusive)?;

    let lock = Self { file, path };
    // The holder record is diagnostic only; failing to write it does not
    // invalidate the lock.
    if let Err(e) = lock.record_holder(purpose) {
      trace!(path = %lock.path.display(), error = %e, "could not record lock holder");
    }
    Ok(lock)
  }

  fn record_holder(&self, purpose: &str) -> io::Result<()> {
    let holder = Holder {
      pid: std::process::id(),
      purpose: purpose.to_string(),
    };
    let mut file = &self.file;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut file, &holder).map_err(io::Error::other)?;
    file.flush()
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// Cache-wide lock.
pub struct CacheLock {
  _file: File,
  mode: LockMode,
}

impl CacheLock {
  /// Take the lock on `<root>/.lock`.
  ///
  /// Shared waits for a running collection to finish. Exclusive does not wait:
  /// it fails with [`LockError::Busy`] while any writer holds the cache.
  pub fn acquire(root: &Path, mode: LockMode, purpose: &str) -> Result<Self, LockError> {
    let path = root.join(CACHE_LOCK_FILENAME);
    let open_err = |source| LockError::Open {
      path: path.clone(),
      source,
    };
    fs::create_dir_all(root).map_err(open_err)?;
    let file = open_lock_file(&path).map_err(open_err)?;

    match mode {
      LockMode::Shared => {
        trace!(root = %root.display(), purpose, "waiting for shared cache lock");
        flock(&file, &path, FlockOperation::LockShared)?;
      }
      LockMode::Exclusive => {
        if let Err(e) = rustix::fs::flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive) {
          if e == rustix::io::Errno::WOULDBLOCK {
            return Err(LockError::Busy {
              root: root.to_path_buf(),
            });
          }
          return Err(LockError::Flock {
            path,
            source: io::Error::from_raw_os_error(e.raw_os_error()),
          });
        }
      }
    }
    debug!(root = %root.display(), ?mode, purpose, "cache lock held");
    Ok(Self { _file: file, mode })
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
  OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(path)
}

fn flock(file: &File, path: &Path, op: FlockOperation) -> Result<(), LockError> {
  rustix::fs::flock(file.as_fd(), op).map_err(|e| LockError::Flock {
    path: path.to_path_buf(),
    source: io::Error::from_raw_os_error(e.raw_os_error()),
  })
}
