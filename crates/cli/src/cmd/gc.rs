use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use repro_lib::gc::{GcRoots, collect_garbage};
use repro_lib::pipeline::{Caches, Project};
use repro_lib::platform::paths;

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

/// Collect garbage in the cache, keeping what the project at `root` pins.
pub fn cmd_gc(root: &Path, dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let project = Project::load(root).context("gc needs the project's pins to know what to keep")?;
  let lock = project.lockfile().ok();
  let cache_root = paths::cache_dir();
  let caches = Caches::at(&cache_root);
  let roots = GcRoots::from_project(&project.pins, lock.as_ref(), &caches.toolchains_dir);

  let result = collect_garbage(&cache_root, &roots, dry_run).context("Garbage collection failed")?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Toolchains removed", &result.stats.toolchains_deleted.to_string());
    print_stat("Blobs removed", &result.stats.blobs_deleted.to_string());
    print_stat("Builds removed", &result.stats.builds_deleted.to_string());
    print_stat("Space freed", &format_bytes(result.stats.total_bytes_freed()));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
