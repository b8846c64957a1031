//! Build derivation.
//!
//! Combines a resolved toolchain, a vendored package set and a filtered
//! source tree into one sandboxed `cargo build`, producing a single binary
//! for the host platform. Identical inputs produce byte-identical output:
//! the environment is fixed, paths are remapped at compile time, and any
//! sandbox or toolchain path left in the binary is neutralized afterwards.

pub mod cache;
pub mod references;
pub mod sandbox;
pub mod source;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::consts::CARGO_LOCK_FILENAME;
use crate::platform::Platform;
use crate::store::lock::{KeyLock, LockError};
use crate::toolchain::Toolchain;
use crate::util::hash::{ContentHash, HashError, Hashable, hash_bytes, hash_directory, hash_file};
use crate::vendor::VendoredSet;

use self::sandbox::{Sandbox, SandboxEnv, run_isolated};
pub use self::source::{EntryKind, SourceFilter, StageError, stage_source};

/// Bumped whenever the derivation changes in a way that invalidates old cache entries.
const DERIVATION_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Stage(#[from] StageError),

  #[error("failed to prepare sandbox at {path}: {source}")]
  Sandbox {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("source tree has no {CARGO_LOCK_FILENAME}")]
  MissingLockfile,

  #[error("failed to hash build inputs: {0}")]
  Hash(#[from] HashError),

  #[error("failed to compute derivation key: {0}")]
  Key(#[source] serde_json::Error),

  #[error("failed to run {program}: {source}")]
  Spawn {
    program: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("compilation of '{binary}' failed (exit code {code:?}):\n{stderr}")]
  Compile {
    binary: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("tests failed (exit code {code:?}); artifact withheld:\n{stderr}")]
  Test { code: Option<i32>, stderr: String },

  #[error("build succeeded but produced no artifact at {0}")]
  MissingArtifact(PathBuf),

  #[error("failed to read artifact {path}: {source}")]
  Artifact {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock build cache entry: {0}")]
  Lock(#[from] LockError),

  #[error("waiting for the build cache lock of {0} was interrupted")]
  Interrupted(DerivationKey),

  #[error("failed to write build cache entry {path}: {source}")]
  Cache {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to copy artifact to {path}: {source}")]
  Output {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Identifies a derivation: every input that can change the output.
#[derive(Debug, Serialize)]
struct DerivationInputs<'a> {
  version: u32,
  toolchain: &'a ContentHash,
  lock: &'a ContentHash,
  source: &'a ContentHash,
  platform: String,
  binary: &'a str,
  test: bool,
}

impl Hashable for DerivationInputs<'_> {}

/// Names a local build cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DerivationKey(pub ContentHash);

impl fmt::Display for DerivationKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Everything a derivation consumes.
#[derive(Debug)]
pub struct BuildRequest<'a> {
  pub toolchain: &'a Toolchain,
  pub vendored: &'a VendoredSet,
  pub source_root: &'a Path,
  pub binary: &'a str,
  pub platform: Platform,
  /// Run `cargo test` before accepting the artifact.
  pub test: bool,
  pub filter: SourceFilter,
  /// Host directories appended to the sandbox PATH.
  pub host_paths: &'a [PathBuf],
  /// Parent of per-build sandboxes.
  pub work_dir: &'a Path,
}

/// A produced binary.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutput {
  pub platform: Platform,
  pub binary: String,
  pub path: PathBuf,
  pub sha256: ContentHash,
  pub size: u64,
  pub key: DerivationKey,
  /// Served from the build cache without compiling.
  pub cached: bool,
  /// Relative paths of the source files the build consumed.
  #[serde(skip)]
  pub staged: Vec<PathBuf>,
}

/// Result of building the same derivation twice.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
  pub key: DerivationKey,
  pub first: ContentHash,
  pub second: ContentHash,
  pub size: u64,
  pub identical: bool,
}

struct Staged {
  sandbox: Sandbox,
  key: DerivationKey,
  listing: Vec<PathBuf>,
}

/// Build `req`, consulting and populating the cache in `builds_dir`.
///
/// Lookup, compilation and store run under the entry's key lock, so
/// concurrent builds of one derivation compile it once and the rest hit.
pub async fn build_derivation(req: &BuildRequest<'_>, builds_dir: &Path) -> Result<BuildOutput, BuildError> {
  let staged = stage(req)?;
  let entry = builds_dir.join(staged.key.0.as_str());
  let _entry_lock = lock_entry(builds_dir, &staged.key).await?;

  let cached = cache::lookup(&entry).map_err(|source| BuildError::Cache {
    path: entry.clone(),
    source,
  })?;
  if let Some(hit) = cached {
    info!(binary = %req.binary, key = %staged.key.0.short(), "using cached build");
    return Ok(BuildOutput {
      platform: req.platform,
      binary: req.binary.to_string(),
      path: hit.path,
      sha256: hit.sha256,
      size: hit.size,
      key: staged.key,
      cached: true,
      staged: staged.listing,
    });
  }

  let bytes = compile(req, &staged.sandbox).await?;
  let sha256 = hash_bytes(&bytes);
  let stored = cache::store(&entry, req.binary, &bytes, &sha256).map_err(|source| BuildError::Cache {
    path: entry.clone(),
    source,
  })?;

  info!(binary = %req.binary, sha256 = %sha256, size = stored.size, "build complete");
  Ok(BuildOutput {
    platform: req.platform,
    binary: req.binary.to_string(),
    path: stored.path,
    sha256,
    size: stored.size,
    key: staged.key,
    cached: false,
    staged: staged.listing,
  })
}

async fn lock_entry(builds_dir: &Path, key: &DerivationKey) -> Result<KeyLock, BuildError> {
  let locks = builds_dir.join(cache::LOCKS_DIR);
  let name = key.0.as_str().to_string();
  let lock = tokio::task::spawn_blocking(move || KeyLock::acquire(&locks, &name, "build"))
    .await
    .map_err(|_| BuildError::Interrupted(key.clone()))??;
  debug!(key = %key.0.short(), "build cache entry locked");
  Ok(lock)
}

/// Build `req` twice in separate sandboxes, bypassing the cache, and compare.
pub async fn verify_determinism(req: &BuildRequest<'_>) -> Result<VerifyReport, BuildError> {
  let first_stage = stage(req)?;
  let first = compile(req, &first_stage.sandbox).await?;
  drop(first_stage.sandbox);

  let second_stage = stage(req)?;
  let second = compile(req, &second_stage.sandbox).await?;

  let first_hash = hash_bytes(&first);
  let second_hash = hash_bytes(&second);
  let identical = first_hash == second_hash;
  info!(binary = %req.binary, identical, first = %first_hash, second = %second_hash, "determinism check");

  Ok(VerifyReport {
    key: second_stage.key,
    first: first_hash,
    second: second_hash,
    size: first.len() as u64,
    identical,
  })
}

/// Copy the artifact to `dest`. A directory destination receives the binary
/// under its own name.
pub fn copy_artifact(output: &BuildOutput, dest: &Path) -> Result<PathBuf, BuildError> {
  let target = if dest.is_dir() { dest.join(&output.binary) } else { dest.to_path_buf() };
  let output_err = |source| BuildError::Output {
    path: target.clone(),
    source,
  };
  if let Some(parent) = target.parent()
    && !parent.as_os_str().is_empty()
  {
    fs::create_dir_all(parent).map_err(output_err)?;
  }
  fs::copy(&output.path, &target).map_err(output_err)?;
  Ok(target)
}

/// Create a sandbox, stage the filtered source and derive the key.
fn stage(req: &BuildRequest<'_>) -> Result<Staged, BuildError> {
  let sandboxes = req.work_dir.join("sandboxes");
  let sandbox = Sandbox::create(&sandboxes).map_err(|source| BuildError::Sandbox {
    path: sandboxes.clone(),
    source,
  })?;

  let listing = stage_source(req.source_root, &sandbox.src(), &req.filter)?;

  let lock_path = sandbox.src().join(CARGO_LOCK_FILENAME);
  if !lock_path.is_file() {
    return Err(BuildError::MissingLockfile);
  }
  let lock = hash_file(&lock_path)?;
  let source = hash_directory(&sandbox.src())?;

  let inputs = DerivationInputs {
    version: DERIVATION_VERSION,
    toolchain: &req.toolchain.sha256,
    lock: &lock,
    source: &source,
    platform: req.platform.triple(),
    binary: req.binary,
    test: req.test,
  };
  let key = DerivationKey(inputs.compute_hash().map_err(BuildError::Key)?);
  debug!(key = %key, files = listing.len(), "derivation key computed");

  Ok(Staged { sandbox, key, listing })
}

/// Compile (and optionally test) inside `sandbox`, returning the stripped artifact.
async fn compile(req: &BuildRequest<'_>, sandbox: &Sandbox) -> Result<Vec<u8>, BuildError> {
  let sandbox_err = |source| BuildError::Sandbox {
    path: sandbox.root().to_path_buf(),
    source,
  };
  sandbox.install_cargo_config(&req.vendored.config_path).map_err(sandbox_err)?;
  let env = SandboxEnv::new(sandbox, req.toolchain, &req.vendored.vendor_dir, req.host_paths).map_err(sandbox_err)?;
  let src = sandbox.src();
  let cargo = &req.toolchain.cargo;
  let spawn_err = |source| BuildError::Spawn {
    program: cargo.clone(),
    source,
  };

  info!(binary = %req.binary, toolchain = %req.toolchain.label, "compiling");
  let build = run_isolated(
    cargo,
    &["build", "--release", "--locked", "--offline", "--bin", req.binary],
    &src,
    &env,
  )
  .await
  .map_err(spawn_err)?;
  if !build.success {
    return Err(BuildError::Compile {
      binary: req.binary.to_string(),
      code: build.code,
      stderr: build.stderr_tail,
    });
  }

  if req.test {
    info!(binary = %req.binary, "running tests");
    let test = run_isolated(cargo, &["test", "--release", "--locked", "--offline"], &src, &env)
      .await
      .map_err(spawn_err)?;
    if !test.success {
      return Err(BuildError::Test {
        code: test.code,
        stderr: test.stderr_tail,
      });
    }
  }

  let artifact = src.join("target").join("release").join(req.binary);
  if !artifact.is_file() {
    return Err(BuildError::MissingArtifact(artifact));
  }
  let mut bytes = fs::read(&artifact).map_err(|source| BuildError::Artifact {
    path: artifact.clone(),
    source,
  })?;

  let prefixes = [
    sandbox.root().as_os_str().as_encoded_bytes(),
    req.vendored.vendor_dir.as_os_str().as_encoded_bytes(),
    req.toolchain.root.as_os_str().as_encoded_bytes(),
  ];
  let stripped = references::strip_references(&mut bytes, &prefixes);
  debug!(binary = %req.binary, references = stripped, "stripped environment paths");

  Ok(bytes)
}
