//! Release triggers: which tag fired, and whether it should release.

use thiserror::Error;

/// Environment variable CI systems set to the pushed ref.
pub const GITHUB_REF_ENV: &str = "GITHUB_REF";

const TAG_REF_PREFIX: &str = "refs/tags/";

#[derive(Debug, Error)]
pub enum TriggerError {
  #[error("no release tag given: pass --tag or set {GITHUB_REF_ENV}=refs/tags/<tag>")]
  NoTag,

  #[error("{GITHUB_REF_ENV} is '{0}', which is not a tag ref")]
  NotATag(String),

  #[error("empty tag pattern")]
  EmptyPattern,

  #[error("invalid tag pattern: {0}")]
  InvalidPattern(#[from] glob::PatternError),
}

/// A glob over tag names: `*`, `?` and `[...]` classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPattern(glob::Pattern);

impl TagPattern {
  pub fn new(pattern: &str) -> Result<Self, TriggerError> {
    if pattern.is_empty() {
      return Err(TriggerError::EmptyPattern);
    }
    Ok(Self(glob::Pattern::new(pattern)?))
  }

  pub fn as_str(&self) -> &str {
    self.0.as_str()
  }

  pub fn matches(&self, tag: &str) -> bool {
    self.0.matches(tag)
  }
}

impl std::fmt::Display for TagPattern {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Extract the tag name from a `refs/tags/<tag>` ref.
pub fn tag_from_ref(git_ref: &str) -> Option<&str> {
  git_ref.strip_prefix(TAG_REF_PREFIX).filter(|t| !t.is_empty())
}

/// The tag that triggered this release: an explicit `--tag`, else `GITHUB_REF`.
pub fn resolve_tag(explicit: Option<&str>) -> Result<String, TriggerError> {
  if let Some(tag) = explicit {
    return Ok(tag.to_string());
  }
  let git_ref = std::env::var(GITHUB_REF_ENV).map_err(|_| TriggerError::NoTag)?;
  tag_from_ref(&git_ref)
    .map(str::to_string)
    .ok_or(TriggerError::NotATag(git_ref))
}
