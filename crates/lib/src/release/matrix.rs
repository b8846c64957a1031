//! Release matrix entries from `repro.toml`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::os::Os;

/// Placeholder in asset names replaced by the triggering tag.
pub const TAG_PLACEHOLDER: &str = "{tag}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
  #[error("release matrix is empty")]
  Empty,

  #[error("matrix entry for {os} has an empty {field}")]
  EmptyField { os: Os, field: &'static str },

  #[error("asset name '{asset}' is produced by more than one matrix entry")]
  DuplicateAsset { asset: String },

  #[error("asset name '{asset}' must be a single file name")]
  InvalidAssetName { asset: String },
}

/// One platform of a release: build `artifact` on `os`, upload it as `asset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
  pub os: Os,
  /// Binary target to build.
  pub artifact: String,
  /// Asset name under the release; `{tag}` is substituted.
  pub asset: String,
}

impl MatrixEntry {
  pub fn new(os: Os, artifact: impl Into<String>, asset: impl Into<String>) -> Self {
    Self {
      os,
      artifact: artifact.into(),
      asset: asset.into(),
    }
  }

  /// The asset name for `tag`.
  pub fn asset_name(&self, tag: &str) -> String {
    self.asset.replace(TAG_PLACEHOLDER, tag)
  }
}

/// Check that `entries` can be released under `tag`.
///
/// Two entries resolving to the same asset name would silently overwrite each
/// other on the host, so that is rejected up front. Asset names are joined
/// into paths by file-backed hosts and must not contain separators or be
/// `.` or `..`.
pub fn validate(entries: &[MatrixEntry], tag: &str) -> Result<(), MatrixError> {
  if entries.is_empty() {
    return Err(MatrixError::Empty);
  }

  let mut seen = BTreeSet::new();
  for entry in entries {
    if entry.artifact.trim().is_empty() {
      return Err(MatrixError::EmptyField {
        os: entry.os,
        field: "artifact",
      });
    }
    if entry.asset.trim().is_empty() {
      return Err(MatrixError::EmptyField {
        os: entry.os,
        field: "asset",
      });
    }
    let asset = entry.asset_name(tag);
    if !is_file_name(&asset) {
      return Err(MatrixError::InvalidAssetName { asset });
    }
    if !seen.insert(asset.clone()) {
      return Err(MatrixError::DuplicateAsset { asset });
    }
  }
  Ok(())
}

/// A non-empty name that joins onto a directory as exactly one component.
pub(crate) fn is_file_name(name: &str) -> bool {
  !name.is_empty() && !name.contains(['/', '\\', '\0']) && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn substitutes_every_tag_placeholder() {
    let entry = MatrixEntry::new(Os::Linux, "track", "track-{tag}-linux-{tag}");
    assert_eq!(entry.asset_name("v1.2.0"), "track-v1.2.0-linux-v1.2.0");
  }

  #[test]
  fn asset_without_placeholder_is_used_verbatim() {
    let entry = MatrixEntry::new(Os::Macos, "track", "track-macos");
    assert_eq!(entry.asset_name("v1"), "track-macos");
  }

  #[test]
  fn deserializes_darwin_alias() {
    let entry: MatrixEntry = toml::from_str("os = \"darwin\"\nartifact = \"a\"\nasset = \"b\"\n").unwrap();
    assert_eq!(entry.os, Os::Macos);
  }

  mod validation {
    use super::*;

    #[test]
    fn accepts_distinct_assets() {
      let entries = vec![
        MatrixEntry::new(Os::Linux, "track", "track-linux-{tag}"),
        MatrixEntry::new(Os::Macos, "track", "track-macos-{tag}"),
      ];
      assert_eq!(validate(&entries, "v1"), Ok(()));
    }

    #[test]
    fn rejects_colliding_assets() {
      let entries = vec![
        MatrixEntry::new(Os::Linux, "track", "track-{tag}"),
        MatrixEntry::new(Os::Macos, "track", "track-{tag}"),
      ];
      assert_eq!(
        validate(&entries, "v1"),
        Err(MatrixError::DuplicateAsset {
          asset: "track-v1".to_string()
        })
      );
    }

    #[test]
    fn rejects_asset_names_that_leave_the_release() {
      for asset in ["../escape-{tag}", "nested/app-{tag}", "..", "dir\\app", "."] {
        let entries = vec![MatrixEntry::new(Os::Linux, "track", asset)];
        assert!(
          matches!(validate(&entries, "v1"), Err(MatrixError::InvalidAssetName { .. })),
          "{asset} accepted"
        );
      }
    }

    #[test]
    fn tag_with_separator_is_caught_after_substitution() {
      let entries = vec![MatrixEntry::new(Os::Linux, "track", "track-{tag}")];
      assert_eq!(
        validate(&entries, "release/1"),
        Err(MatrixError::InvalidAssetName {
          asset: "track-release/1".to_string()
        })
      );
    }

    #[test]
    fn dots_inside_a_name_are_fine() {
      let entries = vec![MatrixEntry::new(Os::Linux, "track", "track-{tag}..tar.gz")];
      assert_eq!(validate(&entries, "v1.0"), Ok(()));
    }

    #[test]
    fn rejects_empty_matrix_and_fields() {
      assert_eq!(validate(&[], "v1"), Err(MatrixError::Empty));
      let entries = vec![MatrixEntry::new(Os::Linux, "", "x")];
      assert!(matches!(
        validate(&entries, "v1"),
        Err(MatrixError::EmptyField { field: "artifact", .. })
      ));
    }
  }
}
