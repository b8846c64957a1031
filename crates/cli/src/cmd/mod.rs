mod build;
mod gc;
mod info;
mod pin;
mod release;
mod vendor;
mod verify;

pub use build::cmd_build;
pub use gc::cmd_gc;
pub use info::cmd_info;
pub use pin::{KindArg, PinAddArgs, cmd_pin_add, cmd_pin_list, cmd_pin_update};
pub use release::{ReleaseArgs, cmd_release};
pub use vendor::cmd_vendor;
pub use verify::cmd_verify;

use std::path::Path;

use anyhow::{Context, Result};

use repro_lib::fetch::Fetcher;
use repro_lib::pipeline::{BuildOptions, Caches, Project};
use repro_lib::platform::Platform;

/// Load the project at `root`, with the caches and fetcher a build needs.
fn load(root: &Path) -> Result<(Project, Caches, Fetcher)> {
  let project = Project::load(root).with_context(|| format!("Failed to load project at {}", root.display()))?;
  let fetcher = project.fetcher().context("Failed to create HTTP client")?;
  Ok((project, Caches::from_env(), fetcher))
}

fn host_build_options(project: &Project, no_test: bool) -> Result<BuildOptions> {
  let platform = Platform::current().context("Unsupported host platform")?;
  Ok(BuildOptions {
    work_dir: project.work_dir(),
    platform,
    test: project.config.build.test && !no_test,
  })
}

fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}
