//! Release hosts: where built artifacts are attached as named assets.
//!
//! Uploading is the only pipeline step that retries. Pinned fetches fail
//! fast because a missing pin is drift; an upload that hits a flaky endpoint
//! is worth repeating. Re-uploading an asset name replaces the old asset.

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::matrix::is_file_name;

#[derive(Debug, Error)]
pub enum HostError {
  #[error("failed to read artifact '{path}': {source}")]
  ReadArtifact {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write asset '{path}': {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// Connection, TLS, timeout or body errors.
  #[error("request to {url} failed: {message}")]
  Transport { url: String, message: String },

  #[error("{method} {url} returned HTTP {status}: {message}")]
  Status {
    method: &'static str,
    url: String,
    status: u16,
    message: String,
  },

  #[error("unexpected response from {url}: {message}")]
  Response { url: String, message: String },

  #[error("GITHUB_TOKEN is not set")]
  MissingToken,

  #[error("invalid repository '{0}' (expected owner/name)")]
  InvalidRepository(String),

  #[error("invalid endpoint URL '{0}'")]
  InvalidEndpoint(String),

  #[error("'{0}' is not a single path component")]
  InvalidName(String),

  #[error("no repository configured: set release.repository in repro.toml")]
  NoRepository,
}

impl HostError {
  /// Transport errors, server errors and rate limiting are worth retrying.
  pub fn is_retryable(&self) -> bool {
    match self {
      HostError::Transport { .. } => true,
      HostError::Status { status, .. } => *status >= 500 || *status == 429,
      _ => false,
    }
  }
}

/// An asset as it exists on the host after upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedAsset {
  pub name: String,
  pub size: u64,
  /// Where the asset can be fetched from (URL or path).
  pub location: String,
}

/// Somewhere releases live.
pub trait ReleaseHost: Send + Sync {
  /// Attach the file at `path` to the release for `tag` as `asset`, replacing
  /// any existing asset of that name. Creates the release if needed.
  fn upload(&self, tag: &str, asset: &str, path: &Path) -> impl Future<Output = Result<UploadedAsset, HostError>> + Send;

  /// Names of the assets currently attached to the release for `tag`.
  fn list_assets(&self, tag: &str) -> impl Future<Output = Result<Vec<String>, HostError>> + Send;

  /// Human-readable host description for logs.
  fn describe(&self) -> String;
}

/// Bounded exponential backoff for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 4,
      initial_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(8),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `retry` (0-based).
  pub fn delay(&self, retry: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry);
    self.initial_delay.saturating_mul(factor).min(self.max_delay)
  }
}

/// Upload through `host`, retrying retryable failures per `policy`.
pub async fn upload_with_retry<H: ReleaseHost>(
  host: &H,
  policy: &RetryPolicy,
  tag: &str,
  asset: &str,
  path: &Path,
) -> Result<UploadedAsset, HostError> {
  let mut attempt = 1;
  loop {
    match host.upload(tag, asset, path).await {
      Ok(uploaded) => {
        info!(tag, asset, host = %host.describe(), attempt, "uploaded asset");
        return Ok(uploaded);
      }
      Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
        let delay = policy.delay(attempt - 1);
        warn!(
          tag,
          asset,
          attempt,
          delay_ms = delay.as_millis() as u64,
          error = %e,
          "upload failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

/// Releases as directories: `<root>/<tag>/<asset>`.
#[derive(Debug, Clone)]
pub struct DirectoryHost {
  root: PathBuf,
}

impl DirectoryHost {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn release_dir(&self, tag: &str) -> PathBuf {
    self.root.join(tag)
  }

  fn write_asset(&self, tag: &str, asset: &str, source: &Path) -> Result<UploadedAsset, HostError> {
    for name in [tag, asset] {
      if !is_file_name(name) {
        return Err(HostError::InvalidName(name.to_string()));
      }
    }
    let bytes = fs::read(source).map_err(|e| HostError::ReadArtifact {
      path: source.to_path_buf(),
      source: e,
    })?;

    let dir = self.release_dir(tag);
    let dest = dir.join(asset);
    let write_err = |e: io::Error| HostError::Write {
      path: dest.clone(),
      source: e,
    };
    fs::create_dir_all(&dir).map_err(write_err)?;

    // Write then rename: an existing asset is replaced in one step.
    let mut staging = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    io::Write::write_all(&mut staging, &bytes).map_err(write_err)?;
    staging.persist(&dest).map_err(|e| write_err(e.error))?;

    debug!(path = %dest.display(), size = bytes.len(), "wrote asset");
    Ok(UploadedAsset {
      name: asset.to_string(),
      size: bytes.len() as u64,
      location: dest.display().to_string(),
    })
  }
}

impl ReleaseHost for DirectoryHost {
  async fn upload(&self, tag: &str, asset: &str, path: &Path) -> Result<UploadedAsset, HostError> {
    self.write_asset(tag, asset, path)
  }

  async fn list_assets(&self, tag: &str) -> Result<Vec<String>, HostError> {
    let dir = self.release_dir(tag);
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(HostError::ReadArtifact { path: dir, source: e }),
    };

    let mut names = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| HostError::ReadArtifact {
        path: dir.clone(),
        source: e,
      })?;
      if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
        names.push(entry.file_name().to_string_lossy().into_owned());
      }
    }
    names.sort();
    Ok(names)
  }

  fn describe(&self) -> String {
    format!("directory {}", self.root.display())
  }
}
