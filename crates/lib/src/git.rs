//! Git access for revision pins and release checkouts.
//!
//! A revision pin (registry index, tool repository) is resolved to a full
//! commit by keeping a mirror under `<cache>/git/<name>/` and fetching into it
//! on every update. A release job clones the triggering tag into its own
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use gix::remote::Direction;
use thiserror::Error;
use tracing::{debug, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum GitError {
  #[error("failed to prepare {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{op} {url} failed: {source}")]
  Remote {
    op: &'static str,
    url: String,
    #[source]
    source: BoxError,
  },

  #[error("cannot resolve '{rev}': {reason}")]
  Revision { rev: String, reason: String },
}

fn remote_err<'a>(op: &'static str, url: &'a str) -> impl Fn(BoxError) -> GitError + 'a {
  move |source| GitError::Remote {
    op,
    url: url.to_string(),
    source,
  }
}

/// Commit that `rev` (default branch when `None`) names in the repository at
/// `url`, using and refreshing the mirror at `cache_dir/<name>`.
pub fn resolve_remote_rev(name: &str, url: &str, rev: Option<&str>, cache_dir: &Path) -> Result<String, GitError> {
  fs::create_dir_all(cache_dir).map_err(|source| GitError::Io {
    path: cache_dir.to_path_buf(),
    source,
  })?;
  let mirror = cache_dir.join(name);

  let repo = match gix::open(&mirror) {
    Ok(repo) => {
      refresh(&repo, url)?;
      repo
    }
    Err(e) => {
      debug!(name, error = %e, "no usable mirror, cloning");
      if mirror.exists() {
        fs::remove_dir_all(&mirror).map_err(|source| GitError::Io {
          path: mirror.clone(),
          source,
        })?;
      }
      info!(name, url, "cloning pinned repository");
      clone(url, &mirror, None)?
    }
  };

  let commit = peel(&repo, rev.unwrap_or("HEAD"))?;
  debug!(name, commit = %commit, "resolved revision");
  Ok(commit)
}

/// Clone `url` at `tag` into `dest` (which must not exist) and return the
/// checked-out commit.
pub fn checkout_tag(url: &str, tag: &str, dest: &Path) -> Result<String, GitError> {
  info!(url, tag, dest = %dest.display(), "checking out tag");
  let repo = clone(url, dest, Some(tag))?;
  peel(&repo, "HEAD")
}

fn clone(url: &str, dest: &Path, ref_name: Option<&str>) -> Result<gix::Repository, GitError> {
  let err = remote_err("clone", url);
  let mut prepare = gix::prepare_clone(url, dest).map_err(|e| err(e.into()))?;
  if ref_name.is_some() {
    prepare = prepare.with_ref_name(ref_name).map_err(|e| err(e.into()))?;
  }
  let (mut checkout, _) = prepare
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| err(e.into()))?;
  let (repo, _) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| remote_err("checkout", url)(e.into()))?;
  Ok(repo)
}

fn refresh(repo: &gix::Repository, url: &str) -> Result<(), GitError> {
  debug!(url, "fetching into mirror");
  let err = remote_err("fetch", url);
  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or_else(|| err("mirror has no remote".into()))?
    .map_err(|e| err(e.into()))?;
  remote
    .connect(Direction::Fetch)
    .map_err(|e| err(e.into()))?
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| err(e.into()))?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| err(e.into()))?;
  Ok(())
}

/// Peel a revision spec (commit, tag, branch, `HEAD`) to a commit id.
fn peel(repo: &gix::Repository, rev: &str) -> Result<String, GitError> {
  let fail = |reason: String| GitError::Revision {
    rev: rev.to_string(),
    reason,
  };
  let id = repo
    .rev_parse_single(rev)
    .map_err(|e| fail(e.to_string()))?;
  let commit = id
    .object()
    .map_err(|e| fail(e.to_string()))?
    .peel_to_commit()
    .map_err(|e| fail(e.to_string()))?;
  Ok(commit.id.to_string())
}

/// Full hex object id, sha1 or sha256.
pub fn is_full_commit_hash(rev: &str) -> bool {
  matches!(rev.len(), 40 | 64) && rev.bytes().all(|b| b.is_ascii_hexdigit())
}
