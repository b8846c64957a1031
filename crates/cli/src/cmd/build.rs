use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use repro_lib::build::copy_artifact;
use repro_lib::pipeline::build_project;

use super::{host_build_options, load, runtime};
use crate::output::{OutputFormat, format_bytes, format_duration, print_json, print_stat, print_success};

pub fn cmd_build(root: &Path, no_test: bool, out: Option<&Path>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let (project, caches, fetcher) = load(root)?;
  let opts = host_build_options(&project, no_test)?;
  info!(platform = %opts.platform, test = opts.test, "building project");

  let rt = runtime()?;
  let result = rt
    .block_on(build_project(&project, &caches, &fetcher, &opts))
    .context("Build failed")?;

  let path = match out {
    Some(dest) => {
      copy_artifact(&result, dest).with_context(|| format!("Failed to copy artifact to {}", dest.display()))?
    }
    None => result.path.clone(),
  };

  if output.is_json() {
    return print_json(&result);
  }

  let how = if result.cached { "from cache" } else { "built" };
  print_success(&format!("{} for {} ({})", result.binary, result.platform, how));
  print_stat("sha256", result.sha256.as_str());
  print_stat("Size", &format_bytes(result.size));
  print_stat("Derivation", &result.key.to_string());
  print_stat("Artifact", &path.display().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
