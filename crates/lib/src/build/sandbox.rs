//! Isolated command execution for builds.
//!
//! Commands run with a cleared environment. Everything a build may see is
//! set explicitly:
//! - `PATH`: the toolchain `bin/` followed by the configured host tool dirs
//! - `HOME=/homeless-shelter`
//! - `CARGO_HOME` inside the sandbox, holding the vendoring redirect
//! - `TMPDIR`/`TMP`/`TEMP`/`TEMPDIR` inside the sandbox
//! - `LANG`/`LC_ALL=C`, `TZ=UTC`, `SOURCE_DATE_EPOCH`
//! - `CARGO_INCREMENTAL=0` and `--remap-path-prefix` flags for every
//!   environment-specific directory

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::SOURCE_DATE_EPOCH;
use crate::toolchain::Toolchain;

/// Separator for `CARGO_ENCODED_RUSTFLAGS`.
const RUSTFLAGS_SEPARATOR: &str = "\x1f";

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// A per-build directory tree.
///
/// ```text
/// sandbox-XXXXXXXX/
/// ├── src/         # staged source tree (cwd of every command)
/// ├── cargo-home/  # CARGO_HOME with config.toml
/// └── tmp/
/// ```
#[derive(Debug)]
pub struct Sandbox {
  dir: tempfile::TempDir,
}

impl Sandbox {
  /// Create a sandbox under `parent`.
  ///
  /// Sandbox names have a fixed length, so neutralized paths in the output
  /// are byte-identical across builds.
  pub fn create(parent: &Path) -> io::Result<Self> {
    fs::create_dir_all(parent)?;
    // Commands see the physical cwd; stripping must match it.
    let parent = dunce::canonicalize(parent)?;
    let dir = tempfile::Builder::new()
      .prefix("sandbox-")
      .rand_bytes(8)
      .tempdir_in(&parent)?;
    for sub in ["src", "cargo-home", "tmp"] {
      fs::create_dir_all(dir.path().join(sub))?;
    }
    Ok(Self { dir })
  }

  pub fn root(&self) -> &Path {
    self.dir.path()
  }

  pub fn src(&self) -> PathBuf {
    self.root().join("src")
  }

  pub fn cargo_home(&self) -> PathBuf {
    self.root().join("cargo-home")
  }

  pub fn tmp(&self) -> PathBuf {
    self.root().join("tmp")
  }

  /// Install the vendoring redirect as `CARGO_HOME/config.toml`.
  pub fn install_cargo_config(&self, config: &Path) -> io::Result<()> {
    fs::copy(config, self.cargo_home().join("config.toml")).map(|_| ())
  }
}

/// The environment of a sandboxed command.
#[derive(Debug, Clone)]
pub struct SandboxEnv {
  vars: Vec<(String, OsString)>,
}

impl SandboxEnv {
  pub fn new(sandbox: &Sandbox, toolchain: &Toolchain, vendor_dir: &Path, host_paths: &[PathBuf]) -> io::Result<Self> {
    let mut path_dirs = vec![toolchain.bin_dir()];
    path_dirs.extend(host_paths.iter().cloned());
    let path = std::env::join_paths(path_dirs).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let remaps = [
      (sandbox.src(), "/build/src"),
      (sandbox.cargo_home(), "/build/cargo-home"),
      (vendor_dir.to_path_buf(), "/build/vendor"),
      (toolchain.root.clone(), "/build/toolchain"),
    ];
    let rustflags = remaps
      .iter()
      .map(|(from, to)| format!("--remap-path-prefix={}={}", from.display(), to))
      .collect::<Vec<_>>()
      .join(RUSTFLAGS_SEPARATOR);

    let tmp = sandbox.tmp().into_os_string();
    let vars = vec![
      ("PATH".to_string(), path),
      ("HOME".to_string(), "/homeless-shelter".into()),
      ("CARGO_HOME".to_string(), sandbox.cargo_home().into_os_string()),
      ("RUSTC".to_string(), toolchain.rustc.clone().into_os_string()),
      ("TMPDIR".to_string(), tmp.clone()),
      ("TMP".to_string(), tmp.clone()),
      ("TEMP".to_string(), tmp.clone()),
      ("TEMPDIR".to_string(), tmp),
      ("LANG".to_string(), "C".into()),
      ("LC_ALL".to_string(), "C".into()),
      ("TZ".to_string(), "UTC".into()),
      ("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.into()),
      ("CARGO_INCREMENTAL".to_string(), "0".into()),
      ("CARGO_TERM_COLOR".to_string(), "never".into()),
      ("CARGO_ENCODED_RUSTFLAGS".to_string(), rustflags.into()),
    ];
    Ok(Self { vars })
  }

  pub fn get(&self, key: &str) -> Option<&OsString> {
    self.vars.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }
}

/// Outcome of a sandboxed command.
#[derive(Debug)]
pub struct CommandOutcome {
  pub code: Option<i32>,
  pub success: bool,
  /// Last lines of stderr.
  pub stderr_tail: String,
}

/// Run `program args...` in `cwd` with exactly the variables of `env`.
pub async fn run_isolated(program: &Path, args: &[&str], cwd: &Path, env: &SandboxEnv) -> io::Result<CommandOutcome> {
  info!(program = %program.display(), args = ?args, "running sandboxed command");

  let mut command = Command::new(program);
  command.args(args).current_dir(cwd).env_clear();
  for (key, value) in &env.vars {
    command.env(key, value);
  }

  debug!(cwd = %cwd.display(), "spawning process");
  let output = command.output().await?;

  let stderr = String::from_utf8_lossy(&output.stderr);
  let stdout = String::from_utf8_lossy(&output.stdout);
  if !output.status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command stdout");
    }
  }

  let lines: Vec<&str> = stderr.lines().collect();
  let stderr_tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

  Ok(CommandOutcome {
    code: output.status.code(),
    success: output.status.success(),
    stderr_tail,
  })
}
