//! Pin file management.
//!
//! The pin file (`repro.pins.json`) records the exact content hash or commit of
//! every external source a build depends on. It sits next to `repro.toml` and is
//! only ever written by the explicit pinning commands.
//!
//! # Pin File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "pins": {
//!     "rust-x86_64-linux": {
//!       "kind": "toolchain",
//!       "url": "https://static.rust-lang.org/dist/rust-1.80.0-x86_64-unknown-linux-gnu.tar.gz",
//!       "sha256": "9a1b...",
//!       "label": "1.80.0",
//!       "lastModified": 1733667300
//!     },
//!     "crates-io": {
//!       "kind": "registry",
//!       "url": "https://static.crates.io/crates",
//!       "git": "https://github.com/rust-lang/crates.io-index",
//!       "rev": "a1b2c3d4...",
//!       "label": "crates.io"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::Platform;
use crate::util::hash::ContentHash;

/// Current pin file format version.
pub const PIN_FILE_VERSION: u32 = 1;

/// What a pin points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
  /// A compiler toolchain archive.
  Toolchain,
  /// A package registry mirror (download base for `.crate` files).
  Registry,
  /// Any other build tool.
  Tool,
}

impl fmt::Display for PinKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      PinKind::Toolchain => "toolchain",
      PinKind::Registry => "registry",
      PinKind::Tool => "tool",
    };
    write!(f, "{}", s)
  }
}

/// One pinned external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinRecord {
  pub kind: PinKind,

  /// Where the content is fetched from.
  pub url: String,

  /// sha256 of the bytes behind `url`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sha256: Option<ContentHash>,

  /// Git repository that `rev` refers to, when different from `url`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git: Option<String>,

  /// Full commit hash.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rev: Option<String>,

  /// Human-readable version label.
  pub label: String,

  /// Unix timestamp of when this pin was last written.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_modified: Option<u64>,
}

/// The pin file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinFile {
  pub version: u32,
  pub pins: BTreeMap<String, PinRecord>,
}

#[derive(Debug, Error)]
pub enum PinError {
  #[error("failed to read pin file: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write pin file: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse pin file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize pin file: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported pin file version {0}, expected {PIN_FILE_VERSION}")]
  UnsupportedVersion(u32),

  #[error("pin file not found at {0}; run `repro pin add` first")]
  Missing(String),

  /// A pin carries neither a content hash nor a commit.
  #[error("pin '{0}' has neither sha256 nor rev and cannot be reproduced")]
  Unaddressed(String),

  /// `rev` is not a full commit hash (branches and short hashes move).
  #[error("pin '{name}' has rev '{rev}', which is not a full commit hash")]
  FloatingRev { name: String, rev: String },

  #[error("no pin named '{0}'")]
  NotFound(String),

  #[error("pin '{name}' is a {actual} pin, expected {expected}")]
  WrongKind {
    name: String,
    expected: PinKind,
    actual: PinKind,
  },
}

impl Default for PinFile {
  fn default() -> Self {
    Self::new()
  }
}

impl PinFile {
  pub fn new() -> Self {
    Self {
      version: PIN_FILE_VERSION,
      pins: BTreeMap::new(),
    }
  }

  /// Load a pin file from the given path.
  ///
  /// Returns `Ok(None)` if the file doesn't exist. Every record is validated:
  /// a pin that does not address immutable content is rejected here rather
  /// than at build time.
  pub fn load(path: &Path) -> Result<Option<Self>, PinError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(PinError::Read(e)),
    };

    let file: PinFile = serde_json::from_str(&content).map_err(PinError::Parse)?;

    if file.version != PIN_FILE_VERSION {
      return Err(PinError::UnsupportedVersion(file.version));
    }

    for (name, record) in &file.pins {
      record.validate(name)?;
    }

    Ok(Some(file))
  }

  /// Load a pin file that must exist.
  pub fn load_required(path: &Path) -> Result<Self, PinError> {
    Self::load(path)?.ok_or_else(|| PinError::Missing(path.display().to_string()))
  }

  /// Save with pretty-printed JSON and a trailing newline.
  pub fn save(&self, path: &Path) -> Result<(), PinError> {
    let mut content = serde_json::to_string_pretty(self).map_err(PinError::Serialize)?;
    content.push('\n');
    fs::write(path, content).map_err(PinError::Write)?;
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<&PinRecord> {
    self.pins.get(name)
  }

  /// Look up a pin by name and check its kind.
  pub fn require(&self, name: &str, kind: PinKind) -> Result<&PinRecord, PinError> {
    let record = self.get(name).ok_or_else(|| PinError::NotFound(name.to_string()))?;
    if record.kind != kind {
      return Err(PinError::WrongKind {
        name: name.to_string(),
        expected: kind,
        actual: record.kind,
      });
    }
    Ok(record)
  }

  /// The toolchain pin for `platform`.
  ///
  /// Toolchain archives are platform-specific, so `<base>-<triple>` (e.g.
  /// `rust-x86_64-linux`) is preferred over the bare `<base>` name.
  pub fn toolchain_for(&self, base: &str, platform: &Platform) -> Result<(String, &PinRecord), PinError> {
    let specific = format!("{}-{}", base, platform.triple());
    if self.pins.contains_key(&specific) {
      return self.require(&specific, PinKind::Toolchain).map(|r| (specific.clone(), r));
    }
    self.require(base, PinKind::Toolchain).map(|r| (base.to_string(), r))
  }

  pub fn insert(&mut self, name: String, record: PinRecord) {
    self.pins.insert(name, record);
  }
}

impl PinRecord {
  pub fn new(kind: PinKind, url: &str, label: &str) -> Self {
    Self {
      kind,
      url: url.to_string(),
      sha256: None,
      git: None,
      rev: None,
      label: label.to_string(),
      last_modified: None,
    }
  }

  pub fn with_sha256(mut self, sha256: ContentHash) -> Self {
    self.sha256 = Some(sha256);
    self
  }

  pub fn with_rev(mut self, git: Option<&str>, rev: &str) -> Self {
    self.git = git.map(str::to_string);
    self.rev = Some(rev.to_string());
    self
  }

  pub fn with_last_modified(mut self, timestamp: u64) -> Self {
    self.last_modified = Some(timestamp);
    self
  }

  /// Repository the `rev` belongs to.
  pub fn git_url(&self) -> &str {
    self.git.as_deref().unwrap_or(&self.url)
  }

  /// The identity of the pinned content, for display and cache keys.
  pub fn reference(&self) -> &str {
    match (&self.sha256, &self.rev) {
      (Some(hash), _) => hash.as_str(),
      (None, Some(rev)) => rev,
      (None, None) => "",
    }
  }

  pub fn validate(&self, name: &str) -> Result<(), PinError> {
    if self.sha256.is_none() && self.rev.is_none() {
      return Err(PinError::Unaddressed(name.to_string()));
    }
    if let Some(rev) = &self.rev
      && !crate::git::is_full_commit_hash(rev)
    {
      return Err(PinError::FloatingRev {
        name: name.to_string(),
        rev: rev.clone(),
      });
    }
    Ok(())
  }
}
