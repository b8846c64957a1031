//! sha256 content hashing.
//!
//! Every identity in the pipeline is a [`ContentHash`]: pinned archives,
//! registry packages (their `Cargo.lock` checksum), staged source trees,
//! derivation keys and artifacts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::consts::HASH_PREFIX_LEN;

/// Lowercase hex sha256 (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Parse a user-supplied hash, normalizing to lowercase.
  ///
  /// Returns `None` unless the input is exactly 64 hex digits.
  pub fn parse(s: &str) -> Option<Self> {
    let s = s.trim();
    if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
      Some(Self(s.to_ascii_lowercase()))
    } else {
      None
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Prefix used in cache directory names and log lines.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(HASH_PREFIX_LEN)]
  }

  fn from_digest(hasher: Sha256) -> Self {
    Self(hex::encode(hasher.finalize()))
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hash of a value's JSON serialization. Field order is declaration order,
/// so the hash is stable as long as the struct is.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ContentHash, serde_json::Error> {
    let serialized = serde_json::to_vec(self)?;
    Ok(hash_bytes(&serialized))
  }
}

#[derive(Debug, Error)]
pub enum HashError {
  #[error("failed to walk {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash::from_digest(Sha256::new_with_prefix(data))
}

/// Stream a file through sha256.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let read_err = |source| HashError::Read {
    path: path.to_path_buf(),
    source,
  };
  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(read_err)?;
  Ok(ContentHash::from_digest(hasher))
}

/// Hash a directory tree: relative paths, file contents, the executable bit
/// and symlink targets. Timestamps, owners and other mode bits are ignored.
///
/// One record per entry, in sorted walk order:
///
/// ```text
/// D:<path>
/// F:<path>:<x|->:<sha256>
/// L:<path>:<target>
/// ```
pub fn hash_directory(root: &Path) -> Result<ContentHash, HashError> {
  let mut hasher = Sha256::new();

  for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(|source| HashError::Walk {
      path: root.to_path_buf(),
      source,
    })?;
    let path = entry.path();
    let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy();
    let file_type = entry.file_type();

    let record = if file_type.is_dir() {
      format!("D:{rel}")
    } else if file_type.is_file() {
      let exec = if is_executable(&entry) { "x" } else { "-" };
      format!("F:{rel}:{exec}:{}", hash_file(path)?)
    } else if file_type.is_symlink() {
      let target = fs::read_link(path).map_err(|source| HashError::Read {
        path: path.to_path_buf(),
        source,
      })?;
      format!("L:{rel}:{}", target.to_string_lossy())
    } else {
      // sockets, fifos, devices
      continue;
    };

    hasher.update(record.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash::from_digest(hasher))
}

#[cfg(unix)]
fn is_executable(entry: &walkdir::DirEntry) -> bool {
  use std::os::unix::fs::PermissionsExt;
  entry.metadata().map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_entry: &walkdir::DirEntry) -> bool {
  false
}
