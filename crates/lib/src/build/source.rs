//! Source tree filtering and staging.
//!
//! Only files that can influence the build are copied into the sandbox.
//! Build outputs, VCS metadata and the pipeline's own work directory are
//! dropped so a stale `target/` never leaks into a derivation.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::consts::WORK_DIR_NAME;

/// Names excluded at the source root.
const ROOT_EXCLUDES: &[&str] = &["target", WORK_DIR_NAME];

/// Names excluded at any depth.
const VCS_EXCLUDES: &[&str] = &[".git", ".hg", ".jj", ".svn"];

#[derive(Debug, Error)]
pub enum StageError {
  #[error("failed to walk source tree: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("failed to stage {path}: {source}")]
  Copy {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  File,
  Dir,
  Symlink,
}

/// Decides which entries of a source tree belong to the build.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
  extra: Vec<String>,
}

impl SourceFilter {
  /// `extra` names are excluded at the root in addition to the defaults
  /// (e.g. a `result` symlink left by another build tool).
  pub fn new(extra: &[String]) -> Self {
    Self { extra: extra.to_vec() }
  }

  /// Whether `rel`, relative to the source root, is part of the build.
  ///
  /// Pure: decided from the path alone. `kind` is accepted so callers can
  /// hand over walker entries directly; every kind is filtered the same way.
  pub fn includes(&self, rel: &Path, _kind: EntryKind) -> bool {
    let mut components = rel.components().filter_map(|c| match c {
      Component::Normal(name) => name.to_str(),
      _ => None,
    });

    let Some(first) = components.next() else {
      return true;
    };
    if ROOT_EXCLUDES.contains(&first) || self.extra.iter().any(|e| e == first) || VCS_EXCLUDES.contains(&first) {
      return false;
    }
    !components.any(|name| VCS_EXCLUDES.contains(&name))
  }
}

/// Copy the filtered tree at `src` into `dest`.
///
/// Returns the sorted relative paths of every staged file and symlink.
pub fn stage_source(src: &Path, dest: &Path, filter: &SourceFilter) -> Result<Vec<PathBuf>, StageError> {
  let copy_err = |path: &Path, source| StageError::Copy {
    path: path.to_path_buf(),
    source,
  };

  fs::create_dir_all(dest).map_err(|e| copy_err(dest, e))?;

  let walker = WalkDir::new(src).sort_by_file_name().into_iter().filter_entry(|e| {
    let rel = e.path().strip_prefix(src).unwrap_or(e.path());
    filter.includes(rel, kind_of(e.file_type()))
  });

  let mut staged = Vec::new();
  for entry in walker {
    let entry = entry?;
    let Ok(rel) = entry.path().strip_prefix(src) else {
      continue;
    };
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dest.join(rel);

    match kind_of(entry.file_type()) {
      EntryKind::Dir => {
        fs::create_dir_all(&target).map_err(|e| copy_err(&target, e))?;
      }
      EntryKind::File => {
        fs::copy(entry.path(), &target).map_err(|e| copy_err(entry.path(), e))?;
        staged.push(rel.to_path_buf());
      }
      EntryKind::Symlink => {
        let link = fs::read_link(entry.path()).map_err(|e| copy_err(entry.path(), e))?;
        symlink(&link, &target).map_err(|e| copy_err(&target, e))?;
        staged.push(rel.to_path_buf());
      }
    }
  }

  staged.sort();
  debug!(src = %src.display(), files = staged.len(), "staged source tree");
  Ok(staged)
}

fn kind_of(file_type: fs::FileType) -> EntryKind {
  if file_type.is_symlink() {
    EntryKind::Symlink
  } else if file_type.is_dir() {
    EntryKind::Dir
  } else {
    EntryKind::File
  }
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn symlink(_link: &Path, _target: &Path) -> io::Result<()> {
  Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks in source trees require unix"))
}
