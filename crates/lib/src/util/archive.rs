//! `.tar.gz` unpacking for toolchain archives and registry packages.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

/// Unpack a gzipped tarball held in memory into `dest`.
///
/// The first path component of every entry is stripped (toolchain and
/// `.crate` archives wrap their contents in a single `<name>-<version>/`
/// directory). Entries that would escape `dest` are rejected. Returns the
/// relative paths of the unpacked regular files, in archive order.
pub fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> io::Result<Vec<PathBuf>> {
  let decoder = GzDecoder::new(bytes);
  let mut archive = Archive::new(decoder);
  let mut files = Vec::new();

  fs::create_dir_all(dest)?;

  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();

    let stripped: PathBuf = path.components().skip(1).collect();
    if stripped.as_os_str().is_empty() {
      continue;
    }
    if stripped.components().any(|c| !matches!(c, Component::Normal(_))) {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("archive entry escapes destination: {}", path.display()),
      ));
    }

    let dest_path = dest.join(&stripped);
    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }

    let is_file = entry.header().entry_type().is_file();
    entry.unpack(&dest_path)?;
    if is_file {
      files.push(stripped);
    }
  }

  Ok(files)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::tar_gz;
  use tempfile::TempDir;

  #[test]
  fn strips_top_level_directory() {
    let temp = TempDir::new().unwrap();
    let archive = tar_gz(&[("pkg-1.0.0/src/lib.rs", b"fn a() {}", 0o644), ("pkg-1.0.0/Cargo.toml", b"[package]", 0o644)]);

    let files = unpack_tar_gz(&archive, temp.path()).unwrap();

    assert_eq!(files, vec![PathBuf::from("src/lib.rs"), PathBuf::from("Cargo.toml")]);
    assert_eq!(fs::read(temp.path().join("src/lib.rs")).unwrap(), b"fn a() {}");
  }

  #[cfg(unix)]
  #[test]
  fn preserves_executable_bit() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let archive = tar_gz(&[("tc/bin/cargo", b"#!/bin/sh\n", 0o755)]);
    unpack_tar_gz(&archive, temp.path()).unwrap();

    let mode = fs::metadata(temp.path().join("bin/cargo")).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0);
  }

  #[test]
  fn rejects_garbage() {
    let temp = TempDir::new().unwrap();
    assert!(unpack_tar_gz(b"not a tarball", temp.path()).is_err());
  }
}
