//! Local build cache.
//!
//! A finished artifact lives at `<cache>/builds/<derivation key>/<binary>`
//! next to a completion marker. The marker is written last and records the
//! artifact hash, so an entry is only trusted when the marker exists and the
//! artifact still hashes to it.
//!
//! Writers of one entry serialize on `<cache>/builds/locks/<key>.lock`.
//! A verified entry is never replaced: readers may be copying from it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::consts::COMPLETE_MARKER;
use crate::util::hash::{ContentHash, hash_file};

const MARKER_VERSION: u32 = 1;

/// Per-entry lock files, beside the entries.
pub const LOCKS_DIR: &str = "locks";

/// Prefix of entries still being assembled.
pub const STAGING_PREFIX: &str = ".build-";

/// Marker file content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMarker {
  pub version: u32,
  /// Always "complete".
  pub status: String,
  /// File name of the artifact inside the entry.
  pub binary: String,
  /// sha256 of the artifact.
  pub output_hash: ContentHash,
}

/// A verified cache entry.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
  pub path: PathBuf,
  pub sha256: ContentHash,
  pub size: u64,
}

/// Read the marker of a cache entry. `None` if absent or unreadable.
pub fn read_marker(entry: &Path) -> Option<BuildMarker> {
  let content = fs::read_to_string(entry.join(COMPLETE_MARKER)).ok()?;
  let marker: BuildMarker = serde_json::from_str(&content).ok()?;
  (marker.version == MARKER_VERSION && marker.status == "complete").then_some(marker)
}

/// Verify an entry's artifact against its marker.
pub fn verify_entry(entry: &Path) -> Option<CachedArtifact> {
  let marker = read_marker(entry)?;
  let path = entry.join(&marker.binary);

  match hash_file(&path) {
    Ok(actual) if actual == marker.output_hash => {
      let size = fs::metadata(&path).ok()?.len();
      Some(CachedArtifact {
        path,
        sha256: actual,
        size,
      })
    }
    Ok(actual) => {
      warn!(
        path = %path.display(),
        expected = %marker.output_hash,
        actual = %actual,
        "cached artifact corrupted, will rebuild"
      );
      None
    }
    Err(e) => {
      warn!(path = %path.display(), error = %e, "failed to hash cached artifact, will rebuild");
      None
    }
  }
}

/// Look up `entry`, removing it when it is incomplete or corrupted.
pub fn lookup(entry: &Path) -> io::Result<Option<CachedArtifact>> {
  if !entry.exists() {
    return Ok(None);
  }
  if let Some(hit) = verify_entry(entry) {
    debug!(path = %entry.display(), "build cache hit");
    return Ok(Some(hit));
  }
  debug!(path = %entry.display(), "removing invalid build cache entry");
  fs::remove_dir_all(entry)?;
  Ok(None)
}

/// Store `bytes` as the artifact of `entry`.
///
/// The entry is assembled in a sibling staging directory and renamed into
/// place, so readers never observe a half-written entry. An entry that is
/// already complete is returned as is.
pub fn store(entry: &Path, binary: &str, bytes: &[u8], sha256: &ContentHash) -> io::Result<CachedArtifact> {
  if let Some(existing) = verify_entry(entry) {
    debug!(path = %entry.display(), "build cache entry already complete");
    return Ok(existing);
  }
  let parent = entry
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache entry has no parent"))?;
  fs::create_dir_all(parent)?;

  let staging = tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir_in(parent)?;
  let artifact = staging.path().join(binary);
  fs::write(&artifact, bytes)?;
  set_executable(&artifact)?;

  let marker = BuildMarker {
    version: MARKER_VERSION,
    status: "complete".to_string(),
    binary: binary.to_string(),
    output_hash: sha256.clone(),
  };
  let content = serde_json::to_string(&marker).map_err(io::Error::other)?;
  fs::write(staging.path().join(COMPLETE_MARKER), format!("{content}\n"))?;

  // Whatever sits at `entry` failed verification above.
  if entry.exists() {
    fs::remove_dir_all(entry)?;
  }
  let staged = staging.keep();
  if let Err(e) = fs::rename(&staged, entry) {
    let _ = fs::remove_dir_all(&staged);
    return verify_entry(entry).ok_or(e);
  }

  Ok(CachedArtifact {
    path: entry.join(binary),
    sha256: sha256.clone(),
    size: bytes.len() as u64,
  })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
  Ok(())
}
