//! Project configuration (`repro.toml`).
//!
//! ```toml
//! [project]
//! binary = "track"
//!
//! [pins]
//! toolchain = "rust"
//! registry = "crates-io"
//!
//! [build]
//! test = true
//! exclude = ["result"]
//! fetch_timeout = "60s"
//!
//! [release]
//! tag_pattern = "v*"
//! repository = "owner/track"
//!
//! [[release.matrix]]
//! os = "linux"
//! artifact = "track"
//! asset = "track-linux-{tag}"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{CONFIG_FILENAME, PINS_FILENAME};
use crate::fetch::DEFAULT_FETCH_TIMEOUT;
use crate::release::MatrixEntry;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {0}")]
  NotFound(PathBuf),

  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("invalid fetch_timeout '{value}': {source}")]
  Timeout {
    value: String,
    #[source]
    source: humantime::DurationError,
  },

  #[error("[build] parallelism must be at least 1")]
  ZeroParallelism,

  #[error("[project] binary must not be empty")]
  EmptyBinary,
}

/// Parsed `repro.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
  pub project: ProjectSection,
  #[serde(default)]
  pub pins: PinsSection,
  #[serde(default)]
  pub build: BuildSection,
  #[serde(default)]
  pub release: ReleaseSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
  /// Binary target produced by the build.
  pub binary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinsSection {
  /// Pin file path, relative to the project root.
  pub file: PathBuf,
  /// Base name of the toolchain pin.
  pub toolchain: String,
  /// Name of the registry mirror pin.
  pub registry: String,
}

impl Default for PinsSection {
  fn default() -> Self {
    Self {
      file: PathBuf::from(PINS_FILENAME),
      toolchain: "rust".to_string(),
      registry: "crates-io".to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
  /// Run the test suite before accepting an artifact.
  pub test: bool,
  /// Extra top-level names filtered out of the source tree.
  pub exclude: Vec<String>,
  /// Concurrent package fetches. Defaults to the CPU count.
  pub parallelism: Option<usize>,
  /// Per-request fetch timeout (humantime, e.g. "60s").
  pub fetch_timeout: Option<String>,
  /// Host directories appended to the sandbox PATH after the toolchain.
  ///
  /// `cargo` needs a linker and `rustc` needs `cc`; these are the only host
  /// tools a build may see.
  pub host_paths: Vec<PathBuf>,
}

impl Default for BuildSection {
  fn default() -> Self {
    Self {
      test: true,
      exclude: Vec::new(),
      parallelism: None,
      fetch_timeout: None,
      host_paths: vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSection {
  pub tag_pattern: String,
  /// `owner/name` of the GitHub repository receiving assets.
  pub repository: Option<String>,
  pub matrix: Vec<MatrixEntry>,
}

impl Default for ReleaseSection {
  fn default() -> Self {
    Self {
      tag_pattern: "v*".to_string(),
      repository: None,
      matrix: Vec::new(),
    }
  }
}

impl ProjectConfig {
  /// Load `repro.toml` from `root`.
  pub fn load(root: &Path) -> Result<Self, ConfigError> {
    Self::load_from(&root.join(CONFIG_FILENAME))
  }

  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::NotFound(path.to_path_buf())),
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    let config = Self::parse(&content).map_err(|e| match e {
      ConfigError::Parse { source, .. } => ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      },
      other => other,
    })?;
    Ok(config)
  }

  /// Parse and validate TOML content.
  pub fn parse(content: &str) -> Result<Self, ConfigError> {
    let config: ProjectConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
      path: PathBuf::from(CONFIG_FILENAME),
      source: Box::new(e),
    })?;

    if config.project.binary.trim().is_empty() {
      return Err(ConfigError::EmptyBinary);
    }
    if config.build.parallelism == Some(0) {
      return Err(ConfigError::ZeroParallelism);
    }
    config.fetch_timeout()?;

    Ok(config)
  }

  pub fn fetch_timeout(&self) -> Result<Duration, ConfigError> {
    match &self.build.fetch_timeout {
      None => Ok(DEFAULT_FETCH_TIMEOUT),
      Some(value) => humantime::parse_duration(value).map_err(|source| ConfigError::Timeout {
        value: value.clone(),
        source,
      }),
    }
  }

  pub fn parallelism(&self) -> usize {
    self
      .build
      .parallelism
      .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
  }

  /// Absolute path of the pin file for a project rooted at `root`.
  pub fn pins_path(&self, root: &Path) -> PathBuf {
    root.join(&self.pins.file)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::os::Os;
  use tempfile::TempDir;

  #[test]
  fn minimal_config_uses_defaults() {
    let config = ProjectConfig::parse("[project]\nbinary = \"track\"\n").unwrap();

    assert_eq!(config.project.binary, "track");
    assert_eq!(config.pins, PinsSection::default());
    assert!(config.build.test);
    assert_eq!(config.release.tag_pattern, "v*");
    assert!(config.release.matrix.is_empty());
    assert_eq!(config.fetch_timeout().unwrap(), DEFAULT_FETCH_TIMEOUT);
    assert!(config.parallelism() >= 1);
  }

  #[test]
  fn full_config() {
    let content = r#"
[project]
binary = "track"

[pins]
toolchain = "stable"

[build]
test = false
exclude = ["result", "dist"]
parallelism = 2
fetch_timeout = "90s"

[release]
tag_pattern = "release-*"
repository = "acme/track"

[[release.matrix]]
os = "linux"
artifact = "track"
asset = "track-linux-{tag}"

[[release.matrix]]
os = "darwin"
artifact = "track"
asset = "track-macos-{tag}"
"#;
    let config = ProjectConfig::parse(content).unwrap();

    assert_eq!(config.pins.toolchain, "stable");
    assert_eq!(config.pins.registry, "crates-io");
    assert!(!config.build.test);
    assert_eq!(config.build.exclude, vec!["result", "dist"]);
    assert_eq!(config.parallelism(), 2);
    assert_eq!(config.fetch_timeout().unwrap(), Duration::from_secs(90));
    assert_eq!(config.release.repository.as_deref(), Some("acme/track"));
    assert_eq!(config.release.matrix.len(), 2);
    assert_eq!(config.release.matrix[1].os, Os::Macos);
  }

  mod errors {
    use super::*;

    #[test]
    fn missing_file() {
      let temp = TempDir::new().unwrap();
      assert!(matches!(ProjectConfig::load(temp.path()), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn missing_binary_is_parse_error_with_path() {
      let temp = TempDir::new().unwrap();
      fs::write(temp.path().join(CONFIG_FILENAME), "[build]\ntest = true\n").unwrap();

      let err = ProjectConfig::load(temp.path()).unwrap_err();
      match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, temp.path().join(CONFIG_FILENAME)),
        other => panic!("unexpected error: {other}"),
      }
    }

    #[test]
    fn bad_timeout() {
      let result = ProjectConfig::parse("[project]\nbinary = \"x\"\n[build]\nfetch_timeout = \"soon\"\n");
      assert!(matches!(result, Err(ConfigError::Timeout { .. })));
    }

    #[test]
    fn zero_parallelism() {
      let result = ProjectConfig::parse("[project]\nbinary = \"x\"\n[build]\nparallelism = 0\n");
      assert!(matches!(result, Err(ConfigError::ZeroParallelism)));
    }
  }
}
