//! Release jobs: checkout and build of one matrix entry.

use std::future::Future;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::matrix::MatrixEntry;
use crate::build::{self, SourceFilter, StageError};
use crate::git::{self, GitError};
use crate::pipeline::{self, BuildOptions, Caches, PipelineError, Project, Stage};
use crate::platform::Platform;
use crate::platform::os::Os;
use crate::util::hash::ContentHash;

use super::host::HostError;

#[derive(Debug, Error)]
pub enum JobError {
  #[error("failed to check out {url} at {tag}: {source}")]
  Git {
    url: String,
    tag: String,
    #[source]
    source: GitError,
  },

  #[error("failed to copy project into job directory: {0}")]
  Copy(#[source] StageError),

  #[error("checkout task failed: {0}")]
  Join(String),

  #[error("platform unavailable on this runner: {target} (runner is {runner})")]
  PlatformUnavailable { target: Os, runner: String },

  #[error(transparent)]
  Pipeline(#[from] PipelineError),

  #[error("failed to stage artifact: {0}")]
  Artifact(#[source] build::BuildError),

  #[error(transparent)]
  Upload(#[from] HostError),
}

impl JobError {
  /// The stage that failed.
  pub fn stage(&self) -> Stage {
    match self {
      JobError::Git { .. } | JobError::Copy(_) | JobError::Join(_) => Stage::Checkout,
      JobError::PlatformUnavailable { .. } | JobError::Artifact(_) => Stage::Build,
      JobError::Pipeline(e) => e.stage(),
      JobError::Upload(_) => Stage::Upload,
    }
  }
}

/// One matrix entry of one release.
#[derive(Debug, Clone)]
pub struct Job {
  pub tag: String,
  pub entry: MatrixEntry,
  /// Private to this job; nothing else writes here.
  pub work_dir: PathBuf,
}

impl Job {
  pub fn asset_name(&self) -> String {
    self.entry.asset_name(&self.tag)
  }
}

/// A built artifact ready for upload.
#[derive(Debug, Clone, Serialize)]
pub struct JobArtifact {
  pub platform: Platform,
  pub path: PathBuf,
  pub sha256: ContentHash,
  pub size: u64,
  pub cached: bool,
}

/// Runs the checkout and build stages of a job.
pub trait JobRunner: Send + Sync {
  fn run(&self, job: &Job) -> impl Future<Output = Result<JobArtifact, JobError>> + Send;
}

/// Where jobs take their source tree from.
#[derive(Debug, Clone)]
pub enum JobSource {
  /// A project directory, copied (filtered) into each job.
  Local(PathBuf),
  /// A git repository; each job clones the release tag.
  Git(String),
}

/// Runs jobs on this machine.
#[derive(Clone)]
pub struct LocalJobRunner {
  source: JobSource,
  caches: Caches,
  runner: Option<Platform>,
  test: Option<bool>,
}

impl LocalJobRunner {
  pub fn new(source: JobSource, caches: Caches) -> Self {
    Self {
      source,
      caches,
      runner: Platform::current(),
      test: None,
    }
  }

  /// Override `build.test` from `repro.toml`.
  pub fn with_test(mut self, test: bool) -> Self {
    self.test = Some(test);
    self
  }

  /// Pretend to run on `platform`.
  pub fn with_runner_platform(mut self, platform: Option<Platform>) -> Self {
    self.runner = platform;
    self
  }

  async fn checkout(&self, job: &Job) -> Result<PathBuf, JobError> {
    let dest = job.work_dir.join("src");
    match &self.source {
      JobSource::Local(root) => {
        let (root, target) = (root.clone(), dest.clone());
        let staged = tokio::task::spawn_blocking(move || {
          build::stage_source(&root, &target, &SourceFilter::default())
        })
        .await
        .map_err(|e| JobError::Join(e.to_string()))?
        .map_err(JobError::Copy)?;
        debug!(files = staged.len(), dest = %dest.display(), "copied project");
      }
      JobSource::Git(url) => {
        let (url, tag, target) = (url.clone(), job.tag.clone(), dest.clone());
        let commit = tokio::task::spawn_blocking(move || {
          git::checkout_tag(&url, &tag, &target).map_err(|source| JobError::Git { url, tag, source })
        })
        .await
        .map_err(|e| JobError::Join(e.to_string()))??;
        debug!(commit = %commit, dest = %dest.display(), "checked out tag");
      }
    }
    Ok(dest)
  }

  fn target_platform(&self, os: Os) -> Result<Platform, JobError> {
    match self.runner {
      Some(runner) if runner.os == os => Ok(runner),
      runner => Err(JobError::PlatformUnavailable {
        target: os,
        runner: runner.map(|p| p.triple()).unwrap_or_else(|| std::env::consts::OS.to_string()),
      }),
    }
  }
}

impl JobRunner for LocalJobRunner {
  async fn run(&self, job: &Job) -> Result<JobArtifact, JobError> {
    info!(tag = %job.tag, os = %job.entry.os, stage = %Stage::Checkout, "job stage");
    let checkout = self.checkout(job).await?;

    info!(tag = %job.tag, os = %job.entry.os, stage = %Stage::Build, "job stage");
    let platform = self.target_platform(job.entry.os)?;

    let mut project = Project::load(&checkout)?;
    project.config.project.binary = job.entry.artifact.clone();
    let fetcher = project.fetcher()?;
    let opts = BuildOptions {
      work_dir: job.work_dir.join("build"),
      platform,
      test: self.test.unwrap_or(project.config.build.test),
    };

    let output = pipeline::build_project(&project, &self.caches, &fetcher, &opts).await?;
    let path = build::copy_artifact(&output, &job.work_dir.join("out").join(job.asset_name()))
      .map_err(JobError::Artifact)?;

    Ok(JobArtifact {
      platform,
      path,
      sha256: output.sha256,
      size: output.size,
      cached: output.cached,
    })
  }
}
