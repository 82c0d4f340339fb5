//! Source descriptor types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::StageError;
use crate::util::fs::normalize_relative;

/// Where a piece of source code comes from.
///
/// Every remote variant carries the integrity information (sha256 or pinned
/// revision) that is checked after the fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
  /// A local directory, copied recursively.
  Directory {
    path: PathBuf,
    #[serde(default)]
    target: Option<String>,
  },
  /// A tarball or zip, verified before extraction.
  Archive {
    url: String,
    sha256: String,
    #[serde(default)]
    target: Option<String>,
  },
  /// A git repository checked out at a pinned revision.
  Git {
    url: String,
    rev: String,
    #[serde(default)]
    target: Option<String>,
  },
  /// A single file, copied without extraction.
  File {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    target: Option<String>,
  },
}

impl SourceDescriptor {
  /// Human readable location used in logs and errors.
  pub fn location(&self) -> String {
    match self {
      SourceDescriptor::Directory { path, .. } => path.display().to_string(),
      SourceDescriptor::Archive { url, .. } | SourceDescriptor::Git { url, .. } | SourceDescriptor::File { url, .. } => {
        url.clone()
      }
    }
  }

  /// Check the integrity invariants before anything is fetched.
  pub fn validate(&self) -> Result<(), StageError> {
    match self {
      SourceDescriptor::Directory { .. } => {}
      SourceDescriptor::Archive { url, sha256, .. } => {
        if !is_sha256(sha256) {
          return Err(StageError::InvalidDescriptor(format!(
            "archive '{}' must carry a 64 character sha256",
            url
          )));
        }
      }
      SourceDescriptor::Git { url, rev, .. } => {
        if rev.trim().is_empty() {
          return Err(StageError::InvalidDescriptor(format!(
            "repository '{}' must pin a revision",
            url
          )));
        }
      }
      SourceDescriptor::File { url, sha256, .. } => match sha256 {
        Some(hash) if !is_sha256(hash) => {
          return Err(StageError::InvalidDescriptor(format!("file '{}' has a malformed sha256", url)));
        }
        None if is_remote_url(url) => {
          return Err(StageError::InvalidDescriptor(format!(
            "remote file '{}' must carry a sha256",
            url
          )));
        }
        _ => {}
      },
    }
    self.target_path().map(|_| ())
  }

  /// Path relative to the source root where this source lands.
  ///
  /// Without an explicit target, archives land under their file stem,
  /// repositories under their name and the rest under their last path
  /// component.
  pub fn target_path(&self) -> Result<PathBuf, StageError> {
    let explicit = match self {
      SourceDescriptor::Directory { target, .. }
      | SourceDescriptor::Archive { target, .. }
      | SourceDescriptor::Git { target, .. }
      | SourceDescriptor::File { target, .. } => target.as_deref(),
    };

    let raw = match (explicit, self) {
      (Some(target), _) => target.to_string(),
      (None, SourceDescriptor::Archive { url, .. }) => archive_stem(&url_to_filename(url)).to_string(),
      (None, SourceDescriptor::Directory { path, .. }) => path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default(),
      (None, SourceDescriptor::Git { url, .. }) => {
        let last = last_url_component(url);
        last.strip_suffix(".git").unwrap_or(last).to_string()
      }
      (None, SourceDescriptor::File { url, .. }) => url_to_filename(url),
    };

    normalize_relative(Path::new(&raw))
      .ok_or_else(|| StageError::InvalidDescriptor(format!("target '{}' escapes the source root", raw)))
  }
}

/// What a staged source resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedSource {
  pub descriptor: SourceDescriptor,
  /// Absolute path of the staged tree or file.
  pub path: PathBuf,
  /// Verified sha256 or checked-out commit id, when applicable.
  pub resolved: Option<String>,
}

pub(crate) fn is_sha256(s: &str) -> bool {
  s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

pub(crate) fn is_remote_url(url: &str) -> bool {
  url.starts_with("http://") || url.starts_with("https://")
}

fn archive_stem(filename: &str) -> &str {
  [".tar.gz", ".tgz", ".tar", ".zip"]
    .iter()
    .find_map(|ext| filename.strip_suffix(ext))
    .unwrap_or(filename)
}

fn last_url_component(url: &str) -> &str {
  url.trim_end_matches('/').rsplit(['/', ':']).next().unwrap_or(url)
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of
/// the URL if no suitable filename can be extracted.
pub(crate) fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split('?').next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let digest = crate::util::hash::hash_bytes(url.as_bytes());
  format!("download_{}", &digest.0[..16])
}
