//! Test utilities for repro-lib.
//!
//! Helpers that fabricate toolchains, crate archives and Cargo projects on
//! disk so pipeline stages can be exercised without network access.

use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Build an in-memory `.tar.gz` archive from `(path, contents, mode)` entries.
pub fn tar_gz(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (path, contents, mode) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(*mode);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, *contents).unwrap();
  }
  let encoder = builder.into_inner().unwrap();
  encoder.finish().unwrap()
}

/// A `.crate` archive as published by a registry (`<name>-<version>/...`).
pub fn crate_archive(name: &str, version: &str) -> Vec<u8> {
  let manifest = format!("[package]\nname = \"{name}\"\nversion = \"{version}\"\nedition = \"2021\"\n");
  let lib = format!("pub fn name() -> &'static str {{ \"{name}\" }}\n");
  let manifest_path = format!("{name}-{version}/Cargo.toml");
  let lib_path = format!("{name}-{version}/src/lib.rs");
  tar_gz(&[
    (manifest_path.as_str(), manifest.as_bytes(), 0o644),
    (lib_path.as_str(), lib.as_bytes(), 0o644),
  ])
}

/// A toolchain archive whose `cargo` is a shell script.
///
/// The fake `cargo` understands `build` (writes `target/release/<bin>` from
/// `src/main.rs` content plus `$PWD`, so path stripping is observable; fails
/// when `src/main.rs` mentions `COMPILE_ERROR`) and `test` (fails when
/// `FAIL_TESTS` exists in the source root).
pub fn fake_toolchain_archive() -> Vec<u8> {
  let cargo = br#"#!/bin/sh
set -e
cmd="$1"
shift
bin=""
while [ $# -gt 0 ]; do
  case "$1" in
    --bin) bin="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$cmd" in
  build)
    case "$(cat src/main.rs)" in
      *COMPILE_ERROR*) echo "error: could not compile" >&2; exit 101 ;;
    esac
    [ -n "$bin" ] || bin=app
    mkdir -p target/release
    { cat src/main.rs; printf 'built-in:%s\n' "$PWD"; } > "target/release/$bin"
    ;;
  test)
    if [ -e FAIL_TESTS ]; then
      echo "test failed" >&2
      exit 101
    fi
    ;;
  *)
    exit 2
    ;;
esac
"#;
  let rustc = b"#!/bin/sh\necho rustc 1.80.0\n";
  tar_gz(&[
    ("rust-1.80.0/bin/cargo", cargo, 0o755),
    ("rust-1.80.0/bin/rustc", rustc, 0o755),
  ])
}

/// Write a minimal Cargo project with the given `Cargo.lock` content.
pub fn write_project(root: &Path, lock: &str) {
  fs::create_dir_all(root.join("src")).unwrap();
  fs::write(
    root.join("Cargo.toml"),
    "[package]\nname = \"app\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
  )
  .unwrap();
  fs::write(root.join("Cargo.lock"), lock).unwrap();
  let mut main = fs::File::create(root.join("src/main.rs")).unwrap();
  main.write_all(b"fn main() { println!(\"hello\"); }\n").unwrap();
}
