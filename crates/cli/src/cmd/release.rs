//! `repro release`: one job per matrix entry, then a per-job summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::debug;

use repro_lib::config::ProjectConfig;
use repro_lib::consts::WORK_DIR_NAME;
use repro_lib::pipeline::Caches;
use repro_lib::platform::os::Os;
use repro_lib::release::{
  DirectoryHost, GitHubHost, HostError, JobResult, JobSource, LocalJobRunner, ReleaseHost, ReleaseOptions,
  ReleaseReport, ReleaseStatus, RetryPolicy, TagPattern, resolve_tag, run_release,
};

use super::runtime;
use crate::output::{
  OutputFormat, format_bytes, format_duration, print_failure, print_info, print_json, print_stat, print_success,
  symbols,
};

pub struct ReleaseArgs {
  pub tag: Option<String>,
  pub only: Option<String>,
  pub dir: Option<PathBuf>,
  pub source: Option<String>,
  pub no_test: bool,
}

pub fn cmd_release(root: &Path, args: &ReleaseArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let root = dunce::canonicalize(root).with_context(|| format!("Project directory {} not found", root.display()))?;
  let config = ProjectConfig::load(&root).context("Failed to load repro.toml")?;

  let tag = resolve_tag(args.tag.as_deref())?;
  let pattern = TagPattern::new(&config.release.tag_pattern).context("Invalid [release] tag_pattern")?;
  let only = args
    .only
    .as_deref()
    .map(|os| os.parse::<Os>())
    .transpose()
    .context("Invalid --only")?;

  // Idle needs neither a host nor credentials.
  if !pattern.matches(&tag) {
    debug!(tag = %tag, pattern = %pattern, "tag does not match release pattern");
    let report = ReleaseReport {
      tag,
      pattern: pattern.to_string(),
      status: ReleaseStatus::Idle,
      jobs: Vec::new(),
    };
    return print_report(&report, output, start);
  }

  let source = match &args.source {
    Some(url) => JobSource::Git(url.clone()),
    None => JobSource::Local(root.clone()),
  };
  let mut runner = LocalJobRunner::new(source, Caches::from_env());
  if args.no_test {
    runner = runner.with_test(false);
  }

  let opts = ReleaseOptions {
    work_root: root.join(WORK_DIR_NAME).join("release").join(&tag),
    tag,
    pattern,
    matrix: config.release.matrix.clone(),
    only,
    retry: RetryPolicy::default(),
  };

  let report = match &args.dir {
    Some(dir) => run(runner, DirectoryHost::new(dir), &opts)?,
    None => {
      let repository = config.release.repository.as_deref().ok_or(HostError::NoRepository)?;
      let host = GitHubHost::from_env(repository).context("Failed to configure GitHub Releases")?;
      run(runner, host, &opts)?
    }
  };

  print_report(&report, output, start)?;
  if report.status == ReleaseStatus::PartiallyFailed {
    let failed = report.failures().count();
    anyhow::bail!(
      "release {} partially failed: {} of {} job(s) failed",
      report.tag,
      failed,
      report.jobs.len()
    );
  }
  Ok(())
}

fn run<H: ReleaseHost + 'static>(runner: LocalJobRunner, host: H, opts: &ReleaseOptions) -> Result<ReleaseReport> {
  let rt = runtime()?;
  let report = rt
    .block_on(run_release(Arc::new(runner), Arc::new(host), opts))
    .with_context(|| format!("Release {} did not start", opts.tag))?;
  Ok(report)
}

fn print_report(report: &ReleaseReport, output: OutputFormat, start: Instant) -> Result<()> {
  if output.is_json() {
    return print_json(report);
  }

  if report.status == ReleaseStatus::Idle {
    print_info(&format!(
      "Tag {} does not match {}; nothing to release (idle)",
      report.tag, report.pattern
    ));
    return Ok(());
  }

  for job in &report.jobs {
    match &job.result {
      JobResult::Uploaded {
        size, location, cached, ..
      } => {
        let from = if *cached { ", cached build" } else { "" };
        print_success(&format!(
          "{} {} {} ({}{})",
          job.os,
          symbols::ARROW,
          job.asset,
          format_bytes(*size),
          from
        ));
        print_stat("Location", location);
      }
      JobResult::Failed { stage, error } => print_failure(job.os.as_str(), &stage.to_string(), error),
    }
  }

  println!();
  print_stat("Tag", &report.tag);
  print_stat("Status", &report.status.to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
