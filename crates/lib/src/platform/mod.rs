//! Build and release targets.
//!
//! A [`Platform`] is the `(arch, os)` pair a derivation is built for. Its
//! triple (`x86_64-linux`, `aarch64-darwin`) feeds the derivation key and
//! selects per-platform toolchain pins (`rust-x86_64-linux`).

pub mod os;
pub mod paths;

use std::fmt;

use serde::{Deserialize, Serialize};

use os::Os;

/// CPU architectures with a pinned toolchain story. One per release target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
  X86_64,
  Aarch64,
}

impl Arch {
  pub fn current() -> Option<Self> {
    match std::env::consts::ARCH {
      "x86_64" => Some(Self::X86_64),
      "aarch64" => Some(Self::Aarch64),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::X86_64 => "x86_64",
      Self::Aarch64 => "aarch64",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// The host, or `None` when this machine cannot run any release target.
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// `<arch>-<os>`, with macOS spelled `darwin`.
  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os.triple_name())
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.triple())
  }
}
