//! Byte fetching for pinned content.
//!
//! Toolchain archives and registry packages are fetched through a single
//! [`Fetcher`] that speaks `http(s)://` and `file://` (or a bare path). Fetch
//! errors are surfaced exactly once: a pinned artifact that cannot be fetched
//! is a hard failure, and retrying would only hide upstream drift.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::util::hash::{ContentHash, hash_bytes};

/// Default per-request timeout for fetches.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!("repro/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
  /// The upstream has no such object (HTTP 404/410 or missing file).
  #[error("not found upstream: {url}")]
  NotFound { url: String },

  /// Any other non-success HTTP status.
  #[error("fetch failed for {url}: HTTP {status}")]
  Status { url: String, status: u16 },

  /// Connection, TLS, timeout or body errors.
  #[error("fetch failed for {url}: {message}")]
  Transport { url: String, message: String },

  /// Fetched bytes do not hash to the pinned value.
  #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
  HashMismatch {
    url: String,
    expected: ContentHash,
    actual: ContentHash,
  },

  #[error("failed to read {path}: {source}")]
  ReadFile {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to build HTTP client: {0}")]
  Client(String),
}

/// Fetches bytes from HTTP(S) or the local filesystem.
#[derive(Debug, Clone)]
pub struct Fetcher {
  client: reqwest::Client,
}

impl Fetcher {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(USER_AGENT)
      .build()
      .map_err(|e| FetchError::Client(e.to_string()))?;
    Ok(Self { client })
  }

  /// Fetch the raw bytes behind `url`.
  pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
    if let Some(path) = local_path(url) {
      debug!(path = %path.display(), "reading local source");
      return match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound { url: url.to_string() }),
        Err(source) => Err(FetchError::ReadFile { path, source }),
      };
    }

    info!(url = %url, "fetching");
    let response = self.client.get(url).send().await.map_err(|e| FetchError::Transport {
      url: url.to_string(),
      message: e.to_string(),
    })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
      return Err(FetchError::NotFound { url: url.to_string() });
    }
    if !status.is_success() {
      return Err(FetchError::Status {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }

    let bytes = response.bytes().await.map_err(|e| FetchError::Transport {
      url: url.to_string(),
      message: e.to_string(),
    })?;

    debug!(url = %url, size = bytes.len(), "fetch complete");
    Ok(bytes.to_vec())
  }

  /// Fetch `url` and verify the bytes hash to `expected`.
  pub async fn fetch_verified(&self, url: &str, expected: &ContentHash) -> Result<Vec<u8>, FetchError> {
    let bytes = self.fetch(url).await?;
    let actual = hash_bytes(&bytes);
    if actual != *expected {
      return Err(FetchError::HashMismatch {
        url: url.to_string(),
        expected: expected.clone(),
        actual,
      });
    }
    Ok(bytes)
  }
}

/// Interpret `file://` URLs and bare paths as local files.
fn local_path(url: &str) -> Option<PathBuf> {
  if let Some(rest) = url.strip_prefix("file://") {
    return Some(PathBuf::from(rest));
  }
  if url.starts_with("http://") || url.starts_with("https://") {
    return None;
  }
  Some(PathBuf::from(url))
}

/// Join a base URL and a relative path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
  format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn fetcher() -> Fetcher {
    Fetcher::new(Duration::from_secs(5)).unwrap()
  }

  #[test]
  fn local_path_detection() {
    assert_eq!(local_path("file:///tmp/a.tar.gz"), Some(PathBuf::from("/tmp/a.tar.gz")));
    assert_eq!(local_path("/tmp/a.tar.gz"), Some(PathBuf::from("/tmp/a.tar.gz")));
    assert_eq!(local_path("https://example.com/a.tar.gz"), None);
  }

  #[test]
  fn join_url_normalizes_slashes() {
    assert_eq!(join_url("https://r.example/", "/serde/x.crate"), "https://r.example/serde/x.crate");
    assert_eq!(join_url("file:///mirror", "a/b"), "file:///mirror/a/b");
  }

  #[tokio::test]
  async fn fetch_local_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("blob");
    std::fs::write(&path, b"data").unwrap();

    let url = format!("file://{}", path.display());
    let bytes = fetcher().fetch(&url).await.unwrap();
    assert_eq!(bytes, b"data");
  }

  #[tokio::test]
  async fn missing_local_file_is_not_found() {
    let result = fetcher().fetch("file:///nonexistent/repro/blob").await;
    assert!(matches!(result, Err(FetchError::NotFound { .. })));
  }

  #[tokio::test]
  async fn http_404_is_not_found() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("GET", "/missing").with_status(404).create_async().await;

    let result = fetcher().fetch(&format!("{}/missing", server.url())).await;

    assert!(matches!(result, Err(FetchError::NotFound { .. })));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn http_error_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/flaky")
      .with_status(503)
      .expect(1)
      .create_async()
      .await;

    let result = fetcher().fetch(&format!("{}/flaky", server.url())).await;

    assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn fetch_verified_rejects_mismatch() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/blob")
      .with_status(200)
      .with_body("tampered")
      .create_async()
      .await;

    let expected = hash_bytes(b"original");
    let result = fetcher()
      .fetch_verified(&format!("{}/blob", server.url()), &expected)
      .await;

    assert!(matches!(result, Err(FetchError::HashMismatch { .. })));
  }

  #[tokio::test]
  async fn fetch_verified_accepts_match() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/blob")
      .with_status(200)
      .with_body("original")
      .create_async()
      .await;

    let expected = hash_bytes(b"original");
    let bytes = fetcher()
      .fetch_verified(&format!("{}/blob", server.url()), &expected)
      .await
      .unwrap();
    assert_eq!(bytes, b"original");
  }
}
