use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operating systems a release can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
  Linux,
  #[serde(alias = "darwin")]
  Macos,
}

impl Os {
  /// The host OS, or `None` on hosts no release job can run on.
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::Macos),
      _ => None,
    }
  }

  /// Name used in release matrices, `--only` and asset names.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::Macos => "macos",
    }
  }

  pub fn triple_name(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::Macos => "darwin",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported operating system '{0}' (expected linux or macos)")]
pub struct UnknownOs(pub String);

impl FromStr for Os {
  type Err = UnknownOs;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "linux" => Ok(Self::Linux),
      "macos" | "darwin" | "osx" => Ok(Self::Macos),
      other => Err(UnknownOs(other.to_string())),
    }
  }
}
