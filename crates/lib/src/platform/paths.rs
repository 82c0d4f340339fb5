use std::path::PathBuf;

use crate::consts::{APP_NAME, CACHE_DIR_ENV};

/// Returns the user's home directory, falling back to the system temp dir.
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var_os("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir)
}

/// Returns the user's home directory, falling back to the system temp dir.
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir)
}

/// Returns the directory for cache files for the application.
///
/// `CROSSBAKE_CACHE_DIR` takes precedence over the platform default.
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  std::env::var_os("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(home_dir)
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application.
///
/// `CROSSBAKE_CACHE_DIR` takes precedence over the platform default.
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Directory where verified downloads are kept, keyed by their sha256.
pub fn downloads_dir() -> PathBuf {
  cache_dir().join("downloads")
}
