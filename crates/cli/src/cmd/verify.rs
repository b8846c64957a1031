use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use repro_lib::pipeline::verify_project;

use super::{host_build_options, load, runtime};
use crate::output::{OutputFormat, format_bytes, format_duration, print_json, print_stat, print_success};

/// Build twice and fail unless both artifacts hash the same.
pub fn cmd_verify(root: &Path, no_test: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let (project, caches, fetcher) = load(root)?;
  let opts = host_build_options(&project, no_test)?;

  let rt = runtime()?;
  let report = rt
    .block_on(verify_project(&project, &caches, &fetcher, &opts))
    .context("Verification build failed")?;

  if output.is_json() {
    print_json(&report)?;
  } else {
    if report.identical {
      print_success(&format!("{} is reproducible", project.config.project.binary));
    }
    print_stat("First", report.first.as_str());
    print_stat("Second", report.second.as_str());
    print_stat("Size", &format_bytes(report.size));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !report.identical {
    anyhow::bail!(
      "{} is not reproducible: {} != {}",
      project.config.project.binary,
      report.first.short(),
      report.second.short()
    );
  }
  Ok(())
}
