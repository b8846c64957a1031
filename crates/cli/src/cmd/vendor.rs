use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use repro_lib::pipeline::vendor_project;

use super::{load, runtime};
use crate::output::{format_duration, print_stat, print_success};

/// Vendor `Cargo.lock` into `.repro/vendor-set` without building.
pub fn cmd_vendor(root: &Path) -> Result<()> {
  let start = Instant::now();
  let (project, caches, fetcher) = load(root)?;
  let out = project.work_dir().join("vendor-set");

  let rt = runtime()?;
  let vendored = rt
    .block_on(vendor_project(&project, &caches, &fetcher, &out))
    .context("Vendoring failed")?;

  print_success(&format!("Vendored {} package(s)", vendored.packages.len()));
  print_stat("Fetched", &vendored.fetched().to_string());
  print_stat("From store", &(vendored.packages.len() - vendored.fetched()).to_string());
  print_stat("Vendor dir", &vendored.vendor_dir.display().to_string());
  print_stat("Cargo config", &vendored.config_path.display().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
