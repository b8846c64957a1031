//! End-to-end build pipeline for one project on one platform.
//!
//! pins -> (toolchain || vendoring) -> derivation. Toolchain resolution and
//! vendoring are independent and run concurrently; compilation needs both.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::build::{self, BuildError, BuildOutput, BuildRequest, SourceFilter, VerifyReport};
use crate::config::{ConfigError, ProjectConfig};
use crate::consts::{CARGO_LOCK_FILENAME, WORK_DIR_NAME};
use crate::fetch::{FetchError, Fetcher};
use crate::pins::{PinError, PinFile, PinKind};
use crate::platform::Platform;
use crate::platform::paths;
use crate::store::lock::{CacheLock, LockError, LockMode};
use crate::store::{ContentStore, DiskStore};
use crate::toolchain::{Toolchain, ToolchainError, resolve_toolchain};
use crate::vendor::{Lockfile, LockfileError, VendorContext, VendorError, VendoredSet, vendor_dependencies};

/// Pipeline stage, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
  Checkout,
  Resolve,
  Vendor,
  Build,
  Test,
  Upload,
}

impl std::fmt::Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Stage::Checkout => "checkout",
      Stage::Resolve => "resolve",
      Stage::Vendor => "vendor",
      Stage::Build => "build",
      Stage::Test => "test",
      Stage::Upload => "upload",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Pins(#[from] PinError),

  #[error(transparent)]
  Lockfile(#[from] LockfileError),

  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error(transparent)]
  Vendor(#[from] VendorError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("waiting for the cache lock was interrupted")]
  Interrupted,
}

impl PipelineError {
  /// The stage this error belongs to.
  pub fn stage(&self) -> Stage {
    match self {
      PipelineError::Config(_)
      | PipelineError::Pins(_)
      | PipelineError::Toolchain(_)
      | PipelineError::Fetch(_)
      | PipelineError::Lock(_)
      | PipelineError::Interrupted => Stage::Resolve,
      PipelineError::Lockfile(_) | PipelineError::Vendor(_) => Stage::Vendor,
      PipelineError::Build(BuildError::Test { .. }) => Stage::Test,
      PipelineError::Build(_) => Stage::Build,
    }
  }
}

/// A project checkout: `repro.toml`, the pin file and the source tree.
#[derive(Debug, Clone)]
pub struct Project {
  pub root: PathBuf,
  pub config: ProjectConfig,
  pub pins: PinFile,
}

impl Project {
  /// Load `repro.toml` and the pin file from `root`.
  pub fn load(root: &Path) -> Result<Self, PipelineError> {
    let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let config = ProjectConfig::load(&root)?;
    let pins = PinFile::load_required(&config.pins_path(&root))?;
    Ok(Self { root, config, pins })
  }

  /// The project-local work directory (`.repro/`).
  pub fn work_dir(&self) -> PathBuf {
    self.root.join(WORK_DIR_NAME)
  }

  pub fn lockfile(&self) -> Result<Lockfile, LockfileError> {
    Lockfile::load(&self.root.join(CARGO_LOCK_FILENAME))
  }

  pub fn fetcher(&self) -> Result<Fetcher, PipelineError> {
    Ok(Fetcher::new(self.config.fetch_timeout()?)?)
  }
}

/// The caches a pipeline reads and writes.
#[derive(Clone)]
pub struct Caches {
  /// Cache root; holds the cache-wide lock.
  pub root: PathBuf,
  pub store: Arc<dyn ContentStore>,
  pub toolchains_dir: PathBuf,
  pub builds_dir: PathBuf,
  pub git_dir: PathBuf,
}

impl Caches {
  /// Caches rooted at `root`, with a disk store at `root/store`.
  pub fn at(root: &Path) -> Self {
    Self {
      root: root.to_path_buf(),
      store: Arc::new(DiskStore::new(root.join("store"))),
      toolchains_dir: root.join("toolchains"),
      builds_dir: root.join("builds"),
      git_dir: root.join("git"),
    }
  }

  /// Caches under the resolved cache directory (`REPRO_CACHE` etc.).
  pub fn from_env() -> Self {
    Self {
      root: paths::cache_dir(),
      store: Arc::new(DiskStore::default()),
      toolchains_dir: paths::toolchains_dir(),
      builds_dir: paths::builds_dir(),
      git_dir: paths::cache_dir().join("git"),
    }
  }

  /// Hold the cache shared for a run that writes into it, keeping garbage
  /// collection out until the guard drops.
  pub async fn lock_shared(&self, purpose: &'static str) -> Result<CacheLock, PipelineError> {
    let root = self.root.clone();
    let lock = tokio::task::spawn_blocking(move || CacheLock::acquire(&root, LockMode::Shared, purpose))
      .await
      .map_err(|_| PipelineError::Interrupted)??;
    Ok(lock)
  }
}

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Where vendored packages and sandboxes go.
  pub work_dir: PathBuf,
  pub platform: Platform,
  pub test: bool,
}

/// Resolved toolchain plus vendored dependencies.
#[derive(Debug, Clone)]
pub struct Prepared {
  pub toolchain: Toolchain,
  pub vendored: VendoredSet,
}

/// Vendor the project's lock file into `out` and write its cargo config.
pub async fn vendor_project(
  project: &Project,
  caches: &Caches,
  fetcher: &Fetcher,
  out: &Path,
) -> Result<VendoredSet, PipelineError> {
  let _cache = caches.lock_shared("vendor").await?;
  let lock = project.lockfile()?;

  // A lock file without external packages needs no registry pin.
  let registry_url = if lock.external().next().is_some() {
    project
      .pins
      .require(&project.config.pins.registry, PinKind::Registry)?
      .url
      .clone()
  } else {
    String::new()
  };

  let ctx = VendorContext {
    store: caches.store.clone(),
    fetcher: fetcher.clone(),
    registry_url,
    parallelism: project.config.parallelism(),
  };
  Ok(vendor_dependencies(&ctx, &lock, out).await?)
}

/// Resolve the toolchain and vendor dependencies concurrently.
pub async fn prepare(
  project: &Project,
  caches: &Caches,
  fetcher: &Fetcher,
  opts: &BuildOptions,
) -> Result<Prepared, PipelineError> {
  let (toolchain_name, toolchain_pin) = project.pins.toolchain_for(&project.config.pins.toolchain, &opts.platform)?;
  let vendor_out = opts.work_dir.join("vendor-set");

  info!(toolchain = %toolchain_name, platform = %opts.platform, "preparing build inputs");
  let (toolchain, vendored) = tokio::try_join!(
    async {
      resolve_toolchain(
        &toolchain_name,
        toolchain_pin,
        &caches.store,
        fetcher,
        &caches.toolchains_dir,
      )
      .await
      .map_err(PipelineError::from)
    },
    vendor_project(project, caches, fetcher, &vendor_out),
  )?;

  Ok(Prepared { toolchain, vendored })
}

fn request<'a>(project: &'a Project, prepared: &'a Prepared, opts: &'a BuildOptions) -> BuildRequest<'a> {
  BuildRequest {
    toolchain: &prepared.toolchain,
    vendored: &prepared.vendored,
    source_root: &project.root,
    binary: &project.config.project.binary,
    platform: opts.platform,
    test: opts.test,
    filter: SourceFilter::new(&project.config.build.exclude),
    host_paths: &project.config.build.host_paths,
    work_dir: &opts.work_dir,
  }
}

/// Run the full pipeline and produce the artifact.
pub async fn build_project(
  project: &Project,
  caches: &Caches,
  fetcher: &Fetcher,
  opts: &BuildOptions,
) -> Result<BuildOutput, PipelineError> {
  let _cache = caches.lock_shared("build").await?;
  let prepared = prepare(project, caches, fetcher, opts).await?;
  let output = build::build_derivation(&request(project, &prepared, opts), &caches.builds_dir).await?;
  Ok(output)
}

/// Run the pipeline and build twice to check determinism.
pub async fn verify_project(
  project: &Project,
  caches: &Caches,
  fetcher: &Fetcher,
  opts: &BuildOptions,
) -> Result<VerifyReport, PipelineError> {
  let _cache = caches.lock_shared("verify").await?;
  let prepared = prepare(project, caches, fetcher, opts).await?;
  let report = build::verify_determinism(&request(project, &prepared, opts)).await?;
  Ok(report)
}
