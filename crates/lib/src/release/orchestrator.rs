//! Tag-triggered release fan-out.
//!
//! A matching tag starts one job per matrix entry. Jobs run concurrently in
//! private work directories and never cancel each other; their results are
//! folded into a single [`ReleaseReport`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::host::{ReleaseHost, RetryPolicy, upload_with_retry};
use super::matrix::{self, MatrixEntry, MatrixError};
use super::runner::{Job, JobError, JobRunner};
use super::trigger::TagPattern;
use crate::pipeline::Stage;
use crate::platform::os::Os;
use crate::util::hash::ContentHash;

#[derive(Debug, Error)]
pub enum ReleaseError {
  #[error(transparent)]
  Matrix(#[from] MatrixError),

  #[error("no matrix entry targets {0}")]
  NoJobs(Os),

  #[error("failed to create job directory under {path}: {source}")]
  WorkDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Inputs of one release run.
#[derive(Debug, Clone)]
pub struct ReleaseOptions {
  pub tag: String,
  pub pattern: TagPattern,
  pub matrix: Vec<MatrixEntry>,
  /// Only run entries for this OS (one runner per OS in CI).
  pub only: Option<Os>,
  /// Parent of the per-job work directories.
  pub work_root: PathBuf,
  pub retry: RetryPolicy,
}

/// Terminal state of a release run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
  /// The tag did not match the release pattern; nothing ran.
  Idle,
  Released,
  PartiallyFailed,
}

impl std::fmt::Display for ReleaseStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      ReleaseStatus::Idle => "idle",
      ReleaseStatus::Released => "released",
      ReleaseStatus::PartiallyFailed => "partially failed",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobResult {
  Uploaded {
    sha256: ContentHash,
    size: u64,
    location: String,
    cached: bool,
  },
  Failed {
    stage: Stage,
    error: String,
  },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
  pub os: Os,
  pub asset: String,
  #[serde(flatten)]
  pub result: JobResult,
}

impl JobOutcome {
  pub fn failed_stage(&self) -> Option<Stage> {
    match &self.result {
      JobResult::Failed { stage, .. } => Some(*stage),
      JobResult::Uploaded { .. } => None,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReport {
  pub tag: String,
  pub pattern: String,
  pub status: ReleaseStatus,
  /// In matrix order.
  pub jobs: Vec<JobOutcome>,
}

impl ReleaseReport {
  pub fn failures(&self) -> impl Iterator<Item = &JobOutcome> {
    self.jobs.iter().filter(|j| j.failed_stage().is_some())
  }

  pub fn is_success(&self) -> bool {
    self.status == ReleaseStatus::Released
  }
}

/// Run the release for `opts.tag`.
///
/// Errors are returned only for problems that stop the release before any
/// job starts; job failures are reported per entry.
pub async fn run_release<R, H>(runner: Arc<R>, host: Arc<H>, opts: &ReleaseOptions) -> Result<ReleaseReport, ReleaseError>
where
  R: JobRunner + 'static,
  H: ReleaseHost + 'static,
{
  if !opts.pattern.matches(&opts.tag) {
    info!(tag = %opts.tag, pattern = %opts.pattern, "tag does not match release pattern, staying idle");
    return Ok(ReleaseReport {
      tag: opts.tag.clone(),
      pattern: opts.pattern.to_string(),
      status: ReleaseStatus::Idle,
      jobs: Vec::new(),
    });
  }

  matrix::validate(&opts.matrix, &opts.tag)?;
  let entries: Vec<MatrixEntry> = opts
    .matrix
    .iter()
    .filter(|e| opts.only.is_none_or(|os| e.os == os))
    .cloned()
    .collect();
  if let (true, Some(os)) = (entries.is_empty(), opts.only) {
    return Err(ReleaseError::NoJobs(os));
  }

  let work_err = |source: io::Error| ReleaseError::WorkDir {
    path: opts.work_root.clone(),
    source,
  };
  fs::create_dir_all(&opts.work_root).map_err(work_err)?;

  info!(tag = %opts.tag, host = %host.describe(), jobs = entries.len(), "starting release");

  let mut tasks = JoinSet::new();
  let mut index_of = HashMap::new();
  for (index, entry) in entries.iter().enumerate() {
    let dir = tempfile::Builder::new()
      .prefix(&format!("job-{}-", entry.os))
      .tempdir_in(&opts.work_root)
      .map_err(work_err)?;
    let job = Job {
      tag: opts.tag.clone(),
      entry: entry.clone(),
      work_dir: dir.path().to_path_buf(),
    };
    let (runner, host, retry) = (runner.clone(), host.clone(), opts.retry);

    let handle = tasks.spawn(async move {
      let result = run_job(runner.as_ref(), host.as_ref(), &retry, &job).await;
      drop(dir);
      result
    });
    index_of.insert(handle.id(), index);
  }

  let mut results: Vec<Option<JobResult>> = vec![None; entries.len()];
  while let Some(joined) = tasks.join_next_with_id().await {
    let (id, result) = match joined {
      Ok((id, result)) => (id, result),
      Err(e) => (
        e.id(),
        JobResult::Failed {
          stage: Stage::Build,
          error: format!("job task failed: {e}"),
        },
      ),
    };
    if let Some(&index) = index_of.get(&id) {
      results[index] = Some(result);
    }
  }

  let jobs: Vec<JobOutcome> = entries
    .iter()
    .zip(results)
    .map(|(entry, result)| JobOutcome {
      os: entry.os,
      asset: entry.asset_name(&opts.tag),
      result: result.unwrap_or(JobResult::Failed {
        stage: Stage::Build,
        error: "job produced no result".to_string(),
      }),
    })
    .collect();

  let status = if jobs.iter().all(|j| j.failed_stage().is_none()) {
    ReleaseStatus::Released
  } else {
    ReleaseStatus::PartiallyFailed
  };
  info!(tag = %opts.tag, %status, "release finished");

  Ok(ReleaseReport {
    tag: opts.tag.clone(),
    pattern: opts.pattern.to_string(),
    status,
    jobs,
  })
}

async fn run_job<R: JobRunner, H: ReleaseHost>(runner: &R, host: &H, retry: &RetryPolicy, job: &Job) -> JobResult {
  let asset = job.asset_name();
  let outcome: Result<JobResult, JobError> = async {
    let artifact = runner.run(job).await?;
    info!(tag = %job.tag, os = %job.entry.os, stage = %Stage::Upload, asset = %asset, "job stage");
    let uploaded = upload_with_retry(host, retry, &job.tag, &asset, &artifact.path).await?;
    Ok(JobResult::Uploaded {
      sha256: artifact.sha256,
      size: uploaded.size,
      location: uploaded.location,
      cached: artifact.cached,
    })
  }
  .await;

  outcome.unwrap_or_else(|e| {
    let stage = e.stage();
    error!(tag = %job.tag, os = %job.entry.os, %stage, error = %e, "release job failed");
    JobResult::Failed {
      stage,
      error: e.to_string(),
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::build::BuildError;
  use crate::pipeline::PipelineError;
  use crate::platform::{Arch, Platform};
  use crate::release::host::{DirectoryHost, HostError, UploadedAsset};
  use crate::release::runner::JobArtifact;
  use crate::util::hash::hash_bytes;
  use std::path::Path;
  use std::time::Duration;
  use tempfile::TempDir;

  /// Writes `<os>:<tag>` as the artifact; fails at `fail_stage` for `fail_os`.
  struct ScriptedRunner {
    fail_os: Option<Os>,
    fail_test: bool,
  }

  impl ScriptedRunner {
    fn ok() -> Self {
      Self {
        fail_os: None,
        fail_test: false,
      }
    }
  }

  impl JobRunner for ScriptedRunner {
    async fn run(&self, job: &Job) -> Result<JobArtifact, JobError> {
      if self.fail_os == Some(job.entry.os) {
        return Err(if self.fail_test {
          JobError::Pipeline(PipelineError::Build(BuildError::Test {
            code: Some(101),
            stderr: "test failed".into(),
          }))
        } else {
          JobError::PlatformUnavailable {
            target: job.entry.os,
            runner: "test".into(),
          }
        });
      }
      let content = format!("{}:{}", job.entry.os, job.tag);
      let path = job.work_dir.join("artifact");
      tokio::fs::write(&path, &content).await.unwrap();
      Ok(JobArtifact {
        platform: Platform::new(Arch::X86_64, job.entry.os),
        path,
        sha256: hash_bytes(content.as_bytes()),
        size: content.len() as u64,
        cached: false,
      })
    }
  }

  struct RejectingHost;

  impl ReleaseHost for RejectingHost {
    async fn upload(&self, _tag: &str, _asset: &str, _path: &Path) -> Result<UploadedAsset, HostError> {
      Err(HostError::Status {
        method: "POST",
        url: "https://uploads.test".into(),
        status: 403,
        message: "forbidden".into(),
      })
    }

    async fn list_assets(&self, _tag: &str) -> Result<Vec<String>, HostError> {
      Ok(Vec::new())
    }

    fn describe(&self) -> String {
      "rejecting".into()
    }
  }

  fn options(temp: &TempDir, tag: &str) -> ReleaseOptions {
    ReleaseOptions {
      tag: tag.to_string(),
      pattern: TagPattern::new("v*").unwrap(),
      matrix: vec![
        MatrixEntry::new(Os::Linux, "track", "track-linux-{tag}"),
        MatrixEntry::new(Os::Macos, "track", "track-macos-{tag}"),
      ],
      only: None,
      work_root: temp.path().join("jobs"),
      retry: RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
      },
    }
  }

  #[tokio::test]
  async fn all_jobs_succeed() {
    let temp = TempDir::new().unwrap();
    let host = Arc::new(DirectoryHost::new(temp.path().join("releases")));

    let report = run_release(Arc::new(ScriptedRunner::ok()), host.clone(), &options(&temp, "v1.0.0"))
      .await
      .unwrap();

    assert_eq!(report.status, ReleaseStatus::Released);
    assert!(report.is_success());
    assert_eq!(report.jobs.len(), 2);
    assert_eq!(
      host.list_assets("v1.0.0").await.unwrap(),
      vec!["track-linux-v1.0.0", "track-macos-v1.0.0"]
    );
    // Job directories are cleaned up.
    assert_eq!(fs::read_dir(temp.path().join("jobs")).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn one_failure_is_partial_and_named() {
    let temp = TempDir::new().unwrap();
    let host = Arc::new(DirectoryHost::new(temp.path().join("releases")));
    let runner = ScriptedRunner {
      fail_os: Some(Os::Macos),
      fail_test: false,
    };

    let report = run_release(Arc::new(runner), host.clone(), &options(&temp, "v1"))
      .await
      .unwrap();

    assert_eq!(report.status, ReleaseStatus::PartiallyFailed);
    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].os, Os::Macos);
    assert_eq!(failed[0].failed_stage(), Some(Stage::Build));
    assert_eq!(host.list_assets("v1").await.unwrap(), vec!["track-linux-v1"]);
  }

  #[tokio::test]
  async fn test_failure_is_attributed_to_test_stage() {
    let temp = TempDir::new().unwrap();
    let host = Arc::new(DirectoryHost::new(temp.path().join("releases")));
    let runner = ScriptedRunner {
      fail_os: Some(Os::Linux),
      fail_test: true,
    };

    let report = run_release(Arc::new(runner), host.clone(), &options(&temp, "v1"))
      .await
      .unwrap();

    assert_eq!(report.jobs[0].failed_stage(), Some(Stage::Test));
    assert!(!host.list_assets("v1").await.unwrap().contains(&"track-linux-v1".to_string()));
  }

  #[tokio::test]
  async fn rerun_overwrites_assets() {
    let temp = TempDir::new().unwrap();
    let host = Arc::new(DirectoryHost::new(temp.path().join("releases")));
    let runner = Arc::new(ScriptedRunner::ok());
    let opts = options(&temp, "v2");

    run_release(runner.clone(), host.clone(), &opts).await.unwrap();
    fs::write(host.release_dir("v2").join("track-linux-v2"), "tampered").unwrap();
    let report = run_release(runner, host.clone(), &opts).await.unwrap();

    assert!(report.is_success());
    assert_eq!(host.list_assets("v2").await.unwrap().len(), 2);
    assert_eq!(
      fs::read_to_string(host.release_dir("v2").join("track-linux-v2")).unwrap(),
      "linux:v2"
    );
  }

  #[tokio::test]
  async fn non_matching_tag_stays_idle() {
    let temp = TempDir::new().unwrap();
    let host = Arc::new(DirectoryHost::new(temp.path().join("releases")));

    let report = run_release(Arc::new(ScriptedRunner::ok()), host.clone(), &options(&temp, "nightly"))
      .await
      .unwrap();

    assert_eq!(report.status, ReleaseStatus::Idle);
    assert!(report.jobs.is_empty());
    assert!(!temp.path().join("releases").exists());
  }

  #[tokio::test]
  async fn only_filters_matrix() {
    let temp = TempDir::new().unwrap();
    let host = Arc::new(DirectoryHost::new(temp.path().join("releases")));
    let mut opts = options(&temp, "v3");
    opts.only = Some(Os::Linux);

    let report = run_release(Arc::new(ScriptedRunner::ok()), host.clone(), &opts)
      .await
      .unwrap();

    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].asset, "track-linux-v3");
  }

  #[tokio::test]
  async fn upload_failure_is_attributed_to_upload() {
    let temp = TempDir::new().unwrap();

    let report = run_release(Arc::new(ScriptedRunner::ok()), Arc::new(RejectingHost), &options(&temp, "v1"))
      .await
      .unwrap();

    assert_eq!(report.status, ReleaseStatus::PartiallyFailed);
    assert!(report.jobs.iter().all(|j| j.failed_stage() == Some(Stage::Upload)));
  }

  #[tokio::test]
  async fn colliding_assets_are_rejected_before_running() {
    let temp = TempDir::new().unwrap();
    let mut opts = options(&temp, "v1");
    opts.matrix[1].asset = "track-linux-{tag}".into();

    let err = run_release(
      Arc::new(ScriptedRunner::ok()),
      Arc::new(DirectoryHost::new(temp.path())),
      &opts,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ReleaseError::Matrix(MatrixError::DuplicateAsset { .. })));
  }

  #[test]
  fn report_serializes_stage_and_status() {
    let report = ReleaseReport {
      tag: "v1".into(),
      pattern: "v*".into(),
      status: ReleaseStatus::PartiallyFailed,
      jobs: vec![JobOutcome {
        os: Os::Macos,
        asset: "a".into(),
        result: JobResult::Failed {
          stage: Stage::Vendor,
          error: "boom".into(),
        },
      }],
    };
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "partially_failed");
    assert_eq!(json["jobs"][0]["result"], "failed");
    assert_eq!(json["jobs"][0]["stage"], "vendor");
    assert_eq!(json["jobs"][0]["os"], "macos");
  }
}
