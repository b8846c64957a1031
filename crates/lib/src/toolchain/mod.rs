//! Toolchain resolution.
//!
//! Materializes the pinned compiler toolchain from its archive. The host's
//! installed toolchain is never consulted: a build only ever sees the `bin/`
//! directory returned here.
//!
//! # Cache Structure
//!
//! ```text
//! <cache>/toolchains/
//! └── <label>-<sha256[..20]>/
//!     ├── .repro-complete     # {"version":1,"sha256":"..."}
//!     ├── bin/cargo
//!     └── bin/rustc
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::COMPLETE_MARKER;
use crate::fetch::{FetchError, Fetcher};
use crate::pins::PinRecord;
use crate::store::{ContentStore, StoreError, put_blocking};
use crate::util::archive::unpack_tar_gz;
use crate::util::hash::ContentHash;

const MARKER_VERSION: u32 = 1;

/// Binaries every toolchain must provide.
const REQUIRED_BINARIES: &[&str] = &["cargo", "rustc"];

#[derive(Debug, Error)]
pub enum ToolchainError {
  /// The pin does not address immutable content.
  #[error("toolchain pin '{name}' has no sha256")]
  MissingHash { name: String },

  /// The archive is absent upstream, or does not contain a toolchain.
  #[error("toolchain not found: {name} ({detail})")]
  NotFound { name: String, detail: String },

  #[error("failed to fetch toolchain '{name}': {source}")]
  Fetch {
    name: String,
    #[source]
    source: FetchError,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to unpack toolchain '{name}' into {path}: {source}")]
  Unpack {
    name: String,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("unpack task for toolchain '{0}' panicked")]
  Join(String),
}

/// A materialized toolchain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toolchain {
  pub label: String,
  pub root: PathBuf,
  pub cargo: PathBuf,
  pub rustc: PathBuf,
  pub sha256: ContentHash,
}

impl Toolchain {
  fn at(root: PathBuf, label: &str, sha256: ContentHash) -> Self {
    Self {
      label: label.to_string(),
      cargo: root.join("bin").join("cargo"),
      rustc: root.join("bin").join("rustc"),
      root,
      sha256,
    }
  }

  pub fn bin_dir(&self) -> PathBuf {
    self.root.join("bin")
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolchainMarker {
  version: u32,
  sha256: ContentHash,
}

/// Directory a toolchain with `label` and `sha256` unpacks to.
pub fn toolchain_dir(toolchains_dir: &Path, label: &str, sha256: &ContentHash) -> PathBuf {
  toolchains_dir.join(format!("{}-{}", sanitize_label(label), sha256.short()))
}

/// Read the hash recorded in a toolchain directory's marker.
pub fn read_marker(dir: &Path) -> Option<ContentHash> {
  let content = fs::read_to_string(dir.join(COMPLETE_MARKER)).ok()?;
  let marker: ToolchainMarker = serde_json::from_str(&content).ok()?;
  (marker.version == MARKER_VERSION).then_some(marker.sha256)
}

/// Resolve the toolchain pinned as `name`.
///
/// Lookup order: an unpacked directory whose marker records the pinned hash,
/// then a store blob, then the pin URL. Fetch failures surface as-is; there is
/// no fallback to another version.
pub async fn resolve_toolchain(
  name: &str,
  pin: &PinRecord,
  store: &Arc<dyn ContentStore>,
  fetcher: &Fetcher,
  toolchains_dir: &Path,
) -> Result<Toolchain, ToolchainError> {
  let sha256 = pin.sha256.clone().ok_or_else(|| ToolchainError::MissingHash { name: name.to_string() })?;
  let dest = toolchain_dir(toolchains_dir, &pin.label, &sha256);

  if is_complete(&dest, &sha256) {
    debug!(pin = %name, path = %dest.display(), "toolchain cache hit");
    return Ok(Toolchain::at(dest, &pin.label, sha256));
  }
  if dest.exists() {
    warn!(pin = %name, path = %dest.display(), "incomplete toolchain directory, removing");
    remove_dir(name, &dest)?;
  }

  let bytes = match store.get(&sha256)? {
    Some(bytes) => bytes,
    None => {
      info!(pin = %name, url = %pin.url, "fetching toolchain");
      let bytes = fetcher
        .fetch_verified(&pin.url, &sha256)
        .await
        .map_err(|source| match source {
          FetchError::NotFound { url } => ToolchainError::NotFound {
            name: name.to_string(),
            detail: format!("no archive at {url}"),
          },
          source => ToolchainError::Fetch {
            name: name.to_string(),
            source,
          },
        })?;
      put_blocking(store, &sha256, bytes).await?
    }
  };

  let owned_name = name.to_string();
  let owned_dir = toolchains_dir.to_path_buf();
  let owned_dest = dest.clone();
  let owned_hash = sha256.clone();
  tokio::task::spawn_blocking(move || install(&owned_name, &bytes, &owned_dir, &owned_dest, &owned_hash))
    .await
    .map_err(|_| ToolchainError::Join(name.to_string()))??;

  info!(pin = %name, label = %pin.label, path = %dest.display(), "toolchain ready");
  Ok(Toolchain::at(dest, &pin.label, sha256))
}

/// Unpack into a staging directory, validate, mark, then rename into place.
fn install(
  name: &str,
  bytes: &[u8],
  toolchains_dir: &Path,
  dest: &Path,
  sha256: &ContentHash,
) -> Result<(), ToolchainError> {
  let unpack_err = |path: &Path, source| ToolchainError::Unpack {
    name: name.to_string(),
    path: path.to_path_buf(),
    source,
  };

  fs::create_dir_all(toolchains_dir).map_err(|e| unpack_err(toolchains_dir, e))?;
  let staging = tempfile::Builder::new()
    .prefix(".unpack-")
    .tempdir_in(toolchains_dir)
    .map_err(|e| unpack_err(toolchains_dir, e))?;

  unpack_tar_gz(bytes, staging.path()).map_err(|e| unpack_err(staging.path(), e))?;

  for binary in REQUIRED_BINARIES {
    if !staging.path().join("bin").join(binary).is_file() {
      return Err(ToolchainError::NotFound {
        name: name.to_string(),
        detail: format!("archive has no bin/{binary}"),
      });
    }
  }

  let marker = ToolchainMarker {
    version: MARKER_VERSION,
    sha256: sha256.clone(),
  };
  let content = serde_json::to_string(&marker).map_err(|e| unpack_err(staging.path(), io::Error::other(e)))?;
  fs::write(staging.path().join(COMPLETE_MARKER), format!("{content}\n"))
    .map_err(|e| unpack_err(staging.path(), e))?;

  let staged = staging.keep();
  if let Err(e) = fs::rename(&staged, dest) {
    let _ = fs::remove_dir_all(&staged);
    // A concurrent resolver may have installed the same toolchain first.
    if !is_complete(dest, sha256) {
      return Err(unpack_err(dest, e));
    }
  }
  Ok(())
}

fn is_complete(dir: &Path, sha256: &ContentHash) -> bool {
  read_marker(dir).as_ref() == Some(sha256)
    && REQUIRED_BINARIES
      .iter()
      .all(|binary| dir.join("bin").join(binary).is_file())
}

fn remove_dir(name: &str, dir: &Path) -> Result<(), ToolchainError> {
  fs::remove_dir_all(dir).map_err(|source| ToolchainError::Unpack {
    name: name.to_string(),
    path: dir.to_path_buf(),
    source,
  })
}

fn sanitize_label(label: &str) -> String {
  label
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
        c
      } else {
        '_'
      }
    })
    .collect()
}
