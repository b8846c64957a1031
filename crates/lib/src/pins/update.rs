//! Pin creation and refresh.
//!
//! This is the only place pins are written. Archive pins are fetched once and
//! recorded by the sha256 of their bytes (the blob is kept in the content
//! store, so the first build after pinning needs no network). Git pins are
//! resolved to a full commit hash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::info;

use super::lock::{PinError, PinFile, PinKind, PinRecord};
use crate::fetch::{FetchError, Fetcher};
use crate::git::{self, GitError};
use crate::store::{ContentStore, StoreError, put_blocking};
use crate::util::hash::hash_bytes;

/// Errors that can occur while adding or updating pins.
#[derive(Debug, Error)]
pub enum PinUpdateError {
  #[error("failed to fetch pin '{name}': {source}")]
  Fetch {
    name: String,
    #[source]
    source: FetchError,
  },

  #[error("failed to resolve git pin '{name}': {source}")]
  Git {
    name: String,
    #[source]
    source: GitError,
  },

  #[error("git resolution task for '{0}' panicked")]
  Join(String),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Pin(#[from] PinError),
}

/// What a new pin should point at.
#[derive(Debug, Clone)]
pub enum PinSource {
  /// An archive at `url`, recorded by content hash.
  Archive { url: String },
  /// A git repository, recorded by commit. `url` is the download base kept in
  /// the record (e.g. a registry mirror); `rev` defaults to HEAD.
  Git {
    url: String,
    git: String,
    rev: Option<String>,
  },
}

/// Result of [`update_pins`].
#[derive(Debug, Default)]
pub struct PinUpdateResult {
  /// Pins whose reference changed: name -> (old, new).
  pub updated: BTreeMap<String, (String, String)>,
  /// Pins that still resolve to the same content.
  pub unchanged: Vec<String>,
}

/// Everything pin resolution needs besides the pin itself.
pub struct PinContext<'a> {
  pub fetcher: &'a Fetcher,
  pub store: &'a Arc<dyn ContentStore>,
  /// Where pinned git repositories are cached.
  pub git_cache: PathBuf,
}

/// Resolve `source` into a new pin record.
pub async fn resolve_pin(
  ctx: &PinContext<'_>,
  name: &str,
  kind: PinKind,
  source: &PinSource,
  label: &str,
) -> Result<PinRecord, PinUpdateError> {
  let record = match source {
    PinSource::Archive { url } => {
      let bytes = ctx.fetcher.fetch(url).await.map_err(|source| PinUpdateError::Fetch {
        name: name.to_string(),
        source,
      })?;
      let hash = hash_bytes(&bytes);
      put_blocking(ctx.store, &hash, bytes).await?;
      info!(pin = %name, sha256 = %hash, "pinned archive");
      PinRecord::new(kind, url, label).with_sha256(hash)
    }
    PinSource::Git { url, git, rev } => {
      let commit = resolve_git(name, git, rev.as_deref(), &ctx.git_cache).await?;
      info!(pin = %name, rev = %commit, "pinned git revision");
      PinRecord::new(kind, url, label).with_rev(Some(git), &commit)
    }
  };

  Ok(record.with_last_modified(now_unix()))
}

/// Add (or replace) the pin `name` in the pin file at `path`.
pub async fn add_pin(
  ctx: &PinContext<'_>,
  path: &Path,
  name: &str,
  kind: PinKind,
  source: &PinSource,
  label: &str,
) -> Result<PinRecord, PinUpdateError> {
  let mut file = PinFile::load(path)?.unwrap_or_default();
  let record = resolve_pin(ctx, name, kind, source, label).await?;
  file.insert(name.to_string(), record.clone());
  file.save(path)?;
  Ok(record)
}

/// Re-resolve pins in `file` and report what moved.
///
/// Archive pins are re-fetched from their URL and re-hashed; git pins are
/// resolved to the current HEAD of their repository. With `names` empty every
/// pin is refreshed. The caller decides whether to save `file`.
pub async fn update_pins(
  ctx: &PinContext<'_>,
  file: &mut PinFile,
  names: &[String],
) -> Result<PinUpdateResult, PinUpdateError> {
  for name in names {
    if file.get(name).is_none() {
      return Err(PinError::NotFound(name.clone()).into());
    }
  }

  let targets: Vec<String> = if names.is_empty() {
    file.pins.keys().cloned().collect()
  } else {
    names.to_vec()
  };

  let mut result = PinUpdateResult::default();

  for name in targets {
    let Some(old) = file.get(&name).cloned() else {
      continue;
    };

    let source = if old.rev.is_some() {
      PinSource::Git {
        url: old.url.clone(),
        git: old.git_url().to_string(),
        rev: None,
      }
    } else {
      PinSource::Archive { url: old.url.clone() }
    };

    let new = resolve_pin(ctx, &name, old.kind, &source, &old.label).await?;
    if new.reference() == old.reference() {
      result.unchanged.push(name);
      continue;
    }

    info!(pin = %name, old = %old.reference(), new = %new.reference(), "pin updated");
    result
      .updated
      .insert(name.clone(), (old.reference().to_string(), new.reference().to_string()));
    file.insert(name, new);
  }

  Ok(result)
}

async fn resolve_git(name: &str, url: &str, rev: Option<&str>, cache: &Path) -> Result<String, PinUpdateError> {
  let (owned_name, owned_url, owned_rev, owned_cache) = (
    name.to_string(),
    url.to_string(),
    rev.map(str::to_string),
    cache.to_path_buf(),
  );

  tokio::task::spawn_blocking(move || {
    git::resolve_remote_rev(&owned_name, &owned_url, owned_rev.as_deref(), &owned_cache)
  })
  .await
  .map_err(|_| PinUpdateError::Join(name.to_string()))?
  .map_err(|source| PinUpdateError::Git {
    name: name.to_string(),
    source,
  })
}

fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;
  use std::time::Duration;
  use tempfile::TempDir;

  fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
  }

  #[tokio::test]
  async fn add_archive_pin_records_hash_and_stores_blob() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("rust.tar.gz");
    std::fs::write(&archive, b"toolchain bytes").unwrap();

    let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let ctx = PinContext {
      fetcher: &fetcher,
      store: &store,
      git_cache: temp.path().join("git"),
    };

    let pins_path = temp.path().join("repro.pins.json");
    let source = PinSource::Archive {
      url: file_url(&archive),
    };
    let record = add_pin(&ctx, &pins_path, "rust", PinKind::Toolchain, &source, "1.80.0")
      .await
      .unwrap();

    let expected = hash_bytes(b"toolchain bytes");
    assert_eq!(record.sha256.as_ref(), Some(&expected));
    assert!(record.last_modified.is_some());
    assert!(store.contains(&expected));

    let loaded = PinFile::load(&pins_path).unwrap().unwrap();
    assert_eq!(loaded.get("rust"), Some(&record));
  }

  #[tokio::test]
  async fn missing_archive_fails_with_pin_name() {
    let temp = TempDir::new().unwrap();
    let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let ctx = PinContext {
      fetcher: &fetcher,
      store: &store,
      git_cache: temp.path().join("git"),
    };

    let source = PinSource::Archive {
      url: file_url(&temp.path().join("nope.tar.gz")),
    };
    let err = resolve_pin(&ctx, "rust", PinKind::Toolchain, &source, "x")
      .await
      .unwrap_err();

    assert!(err.to_string().contains("'rust'"));
    assert!(matches!(err, PinUpdateError::Fetch { .. }));
  }

  mod update {
    use super::*;

    #[tokio::test]
    async fn reports_changed_and_unchanged_pins() {
      let temp = TempDir::new().unwrap();
      let a = temp.path().join("a.tar.gz");
      let b = temp.path().join("b.tar.gz");
      std::fs::write(&a, b"a-v1").unwrap();
      std::fs::write(&b, b"b-v1").unwrap();

      let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
      let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
      let ctx = PinContext {
        fetcher: &fetcher,
        store: &store,
        git_cache: temp.path().join("git"),
      };

      let mut file = PinFile::new();
      for (name, path) in [("a", &a), ("b", &b)] {
        let source = PinSource::Archive { url: file_url(path) };
        let record = resolve_pin(&ctx, name, PinKind::Tool, &source, "v1").await.unwrap();
        file.insert(name.to_string(), record);
      }

      std::fs::write(&a, b"a-v2").unwrap();
      let result = update_pins(&ctx, &mut file, &[]).await.unwrap();

      let (old, new) = &result.updated["a"];
      assert_eq!(old, hash_bytes(b"a-v1").as_str());
      assert_eq!(new, hash_bytes(b"a-v2").as_str());
      assert_eq!(result.unchanged, vec!["b".to_string()]);
      assert_eq!(file.get("a").unwrap().sha256, Some(hash_bytes(b"a-v2")));
    }

    #[tokio::test]
    async fn unknown_name_is_rejected() {
      let temp = TempDir::new().unwrap();
      let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
      let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
      let ctx = PinContext {
        fetcher: &fetcher,
        store: &store,
        git_cache: temp.path().join("git"),
      };

      let mut file = PinFile::new();
      let result = update_pins(&ctx, &mut file, &["ghost".to_string()]).await;
      assert!(matches!(result, Err(PinUpdateError::Pin(PinError::NotFound(_)))));
    }
  }
}
