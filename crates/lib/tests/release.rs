//! End-to-end release runs: a local project, a pinned fake toolchain and a
//! directory host standing in for GitHub Releases.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;

use repro_lib::pins::{PinFile, PinKind, PinRecord};
use repro_lib::pipeline::{Caches, Stage};
use repro_lib::platform::Platform;
use repro_lib::platform::os::Os;
use repro_lib::release::{
  DirectoryHost, JobResult, JobSource, LocalJobRunner, MatrixEntry, ReleaseOptions, ReleaseReport, ReleaseStatus,
  RetryPolicy, TagPattern, run_release,
};
use repro_lib::util::hash::hash_bytes;

const TAG: &str = "v1.0.0";

const LOCK: &str = "version = 4\n\n[[package]]\nname = \"app\"\nversion = \"0.1.0\"\n";

/// `cargo build` copies `src/main.rs` to the artifact; `cargo test` fails when
/// `FAIL_TESTS` exists.
const FAKE_CARGO: &[u8] = br#"#!/bin/sh
set -e
cmd="$1"
shift
bin=app
while [ $# -gt 0 ]; do
  case "$1" in
    --bin) bin="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$cmd" in
  build) mkdir -p target/release; cat src/main.rs > "target/release/$bin" ;;
  test) [ ! -e FAIL_TESTS ] || { echo "test failed" >&2; exit 101; } ;;
  *) exit 2 ;;
esac
"#;

fn toolchain_archive() -> Vec<u8> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (path, contents) in [
    ("rust-1.80.0/bin/cargo", FAKE_CARGO),
    ("rust-1.80.0/bin/rustc", b"#!/bin/sh\necho rustc 1.80.0\n".as_slice()),
  ] {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, contents).unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap()
}

fn host_os() -> Os {
  Platform::current().expect("supported host").os
}

fn other_os() -> Os {
  match host_os() {
    Os::Linux => Os::Macos,
    Os::Macos => Os::Linux,
  }
}

struct Fixture {
  temp: TempDir,
}

impl Fixture {
  fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let archive = toolchain_archive();
    let archive_path = temp.path().join("rust-1.80.0.tar.gz");
    fs::write(&archive_path, &archive).unwrap();

    let project = temp.path().join("project");
    fs::create_dir_all(project.join("src")).unwrap();
    fs::write(
      project.join("Cargo.toml"),
      "[package]\nname = \"app\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
    )
    .unwrap();
    fs::write(project.join("Cargo.lock"), LOCK).unwrap();
    fs::write(project.join("src/main.rs"), "fn main() { println!(\"hello\"); }\n").unwrap();
    fs::write(project.join("repro.toml"), "[project]\nbinary = \"app\"\n").unwrap();

    let mut pins = PinFile::new();
    pins.insert(
      "rust".to_string(),
      PinRecord::new(
        PinKind::Toolchain,
        &format!("file://{}", archive_path.display()),
        "1.80.0",
      )
      .with_sha256(hash_bytes(&archive)),
    );
    pins.save(&project.join("repro.pins.json")).unwrap();

    Self { temp }
  }

  fn project(&self) -> PathBuf {
    self.temp.path().join("project")
  }

  fn releases(&self) -> PathBuf {
    self.temp.path().join("releases")
  }

  fn work_root(&self) -> PathBuf {
    self.temp.path().join("work")
  }

  fn options(&self, matrix: Vec<MatrixEntry>, only: Option<Os>) -> ReleaseOptions {
    ReleaseOptions {
      tag: TAG.to_string(),
      pattern: TagPattern::new("v*").unwrap(),
      matrix,
      only,
      work_root: self.work_root(),
      retry: RetryPolicy::default(),
    }
  }

  async fn release(&self, opts: &ReleaseOptions) -> ReleaseReport {
    let caches = Caches::at(&self.temp.path().join("cache"));
    let runner = LocalJobRunner::new(JobSource::Local(self.project()), caches);
    let host = DirectoryHost::new(self.releases());
    run_release(Arc::new(runner), Arc::new(host), opts).await.unwrap()
  }
}

fn matrix() -> Vec<MatrixEntry> {
  vec![
    MatrixEntry::new(host_os(), "app", "app-host-{tag}"),
    MatrixEntry::new(other_os(), "app", "app-other-{tag}"),
  ]
}

fn uploaded(report: &ReleaseReport, index: usize) -> (&str, bool) {
  match &report.jobs[index].result {
    JobResult::Uploaded { location, cached, .. } => (location.as_str(), *cached),
    JobResult::Failed { stage, error } => panic!("job {index} failed at {stage}: {error}"),
  }
}

fn is_empty_dir(path: &Path) -> bool {
  fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

#[tokio::test(flavor = "multi_thread")]
async fn unavailable_platform_fails_alone() {
  let fx = Fixture::new();
  let report = fx.release(&fx.options(matrix(), None)).await;

  assert_eq!(report.status, ReleaseStatus::PartiallyFailed);
  assert_eq!(report.jobs.len(), 2);

  let (location, cached) = uploaded(&report, 0);
  assert!(!cached);
  let asset = fx.releases().join(TAG).join(format!("app-host-{TAG}"));
  assert_eq!(Path::new(location), asset);
  assert_eq!(fs::read_to_string(&asset).unwrap(), "fn main() { println!(\"hello\"); }\n");

  assert_eq!(report.jobs[1].failed_stage(), Some(Stage::Build));
  match &report.jobs[1].result {
    JobResult::Failed { error, .. } => assert!(error.contains("platform unavailable on this runner")),
    other => panic!("unexpected result {other:?}"),
  }
  assert!(!fx.releases().join(TAG).join(format!("app-other-{TAG}")).exists());
  assert!(is_empty_dir(&fx.work_root()));
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_reuses_build_and_overwrites_asset() {
  let fx = Fixture::new();
  let opts = fx.options(matrix(), Some(host_os()));

  let first = fx.release(&opts).await;
  assert_eq!(first.status, ReleaseStatus::Released);
  let asset = fx.releases().join(TAG).join(format!("app-host-{TAG}"));
  let before = hash_bytes(&fs::read(&asset).unwrap());

  let second = fx.release(&opts).await;
  assert_eq!(second.status, ReleaseStatus::Released);
  let (_, cached) = uploaded(&second, 0);
  assert!(cached);
  assert_eq!(hash_bytes(&fs::read(&asset).unwrap()), before);
  assert_eq!(fs::read_dir(fx.releases().join(TAG)).unwrap().count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_tests_block_upload() {
  let fx = Fixture::new();
  fs::write(fx.project().join("FAIL_TESTS"), "").unwrap();

  let report = fx.release(&fx.options(matrix(), Some(host_os()))).await;

  assert_eq!(report.status, ReleaseStatus::PartiallyFailed);
  assert_eq!(report.jobs[0].failed_stage(), Some(Stage::Test));
  assert!(!fx.releases().join(TAG).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn non_matching_tag_runs_nothing() {
  let fx = Fixture::new();
  let mut opts = fx.options(matrix(), None);
  opts.tag = "nightly".to_string();

  let report = fx.release(&opts).await;

  assert_eq!(report.status, ReleaseStatus::Idle);
  assert!(report.jobs.is_empty());
  assert!(!fx.releases().exists());
  assert!(!fx.work_root().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn same_artifact_jobs_share_one_build() {
  let fx = Fixture::new();
  let entries: Vec<MatrixEntry> = (0..8)
    .map(|i| MatrixEntry::new(host_os(), "app", format!("app-{i}-{{tag}}")))
    .collect();

  for round in 0..3 {
    let cache = fx.temp.path().join("cache");
    if cache.exists() {
      fs::remove_dir_all(&cache).unwrap();
    }

    let report = fx.release(&fx.options(entries.clone(), None)).await;

    assert_eq!(report.status, ReleaseStatus::Released, "round {round}: {report:?}");
    let fresh = (0..entries.len()).filter(|&i| !uploaded(&report, i).1).count();
    assert_eq!(fresh, 1, "round {round}: exactly one job compiles");
    for i in 0..entries.len() {
      let asset = fx.releases().join(TAG).join(format!("app-{i}-{TAG}"));
      assert_eq!(fs::read_to_string(&asset).unwrap(), "fn main() { println!(\"hello\"); }\n");
    }
  }
}
