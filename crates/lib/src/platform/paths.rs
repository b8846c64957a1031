use std::path::PathBuf;

use crate::consts::{APP_NAME, CACHE_ENV};

/// Returns the user's home directory, if `HOME` is set
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

/// Returns the cache root shared by the toolchain, package and build caches.
///
/// Resolution order: `REPRO_CACHE`, `$XDG_CACHE_HOME/repro`, `~/.cache/repro`,
/// and finally the system temp directory when no home is available.
pub fn cache_dir() -> PathBuf {
  if let Ok(path) = std::env::var(CACHE_ENV) {
    return PathBuf::from(path);
  }

  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .ok()
    .or_else(|| home_dir().map(|h| h.join(".cache")))
    .unwrap_or_else(std::env::temp_dir);
  cache_home.join(APP_NAME)
}

/// Content-addressed blob store (`<cache>/store`).
pub fn store_dir() -> PathBuf {
  cache_dir().join("store")
}

/// Unpacked toolchains (`<cache>/toolchains`).
pub fn toolchains_dir() -> PathBuf {
  cache_dir().join("toolchains")
}

/// Build derivation outputs (`<cache>/builds`).
pub fn builds_dir() -> PathBuf {
  cache_dir().join("builds")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn env_override_takes_precedence() {
    temp_env::with_vars(
      [
        (CACHE_ENV, Some("/custom/cache")),
        ("XDG_CACHE_HOME", Some("/xdg")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/custom/cache"));
        assert_eq!(store_dir(), PathBuf::from("/custom/cache/store"));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_cache_home_is_used() {
    temp_env::with_vars(
      [
        (CACHE_ENV, None::<&str>),
        ("XDG_CACHE_HOME", Some("/xdg")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/xdg").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn falls_back_to_home_cache() {
    temp_env::with_vars(
      [
        (CACHE_ENV, None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/home/user/.cache").join(APP_NAME));
        assert_eq!(toolchains_dir(), PathBuf::from("/home/user/.cache/repro/toolchains"));
        assert_eq!(builds_dir(), PathBuf::from("/home/user/.cache/repro/builds"));
      },
    );
  }
}
