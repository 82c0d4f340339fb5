//! Source staging.
//!
//! Materializes [`SourceDescriptor`]s under a workspace's source root.
//! Remote sources fail closed: an archive whose bytes do not hash to the
//! declared sha256 is never extracted, and a repository without the pinned
//! revision is never checked out.

mod archive;
mod download;
mod git;
mod types;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

pub use archive::{ArchiveKind, unpack_archive};
pub use download::download_verified;
pub use types::{SourceDescriptor, StagedSource};

use crate::platform::paths::downloads_dir;
use crate::util::fs::copy_dir_recursive;
use crate::util::hash::hash_bytes;
use crate::workspace::BuildWorkspace;
use download::{AttemptError, with_retries};

/// Errors that can occur while staging a source.
#[derive(Debug, Error)]
pub enum StageError {
  #[error("invalid source: {0}")]
  InvalidDescriptor(String),

  #[error("integrity mismatch for '{url}': expected sha256 {expected}, got {actual}")]
  IntegrityMismatch { url: String, expected: String, actual: String },

  #[error("revision '{rev}' not found in '{url}'")]
  RevisionNotFound { url: String, rev: String },

  #[error("failed to fetch '{url}' after {attempts} attempt(s): {message}")]
  FetchFailed { url: String, attempts: u32, message: String },

  #[error("unsupported archive format: {0}")]
  UnsupportedArchive(String),

  #[error("failed to extract '{archive}': {message}")]
  Extract { archive: PathBuf, message: String },

  #[error("git error for '{url}': {message}")]
  Git { url: String, message: String },

  #[error("staging destination already exists: {0}")]
  DestinationExists(PathBuf),

  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
}

/// Knobs for fetching.
#[derive(Debug, Clone)]
pub struct StagerConfig {
  /// Total attempts for a transient transport failure.
  pub max_attempts: u32,
  /// Delay before retry `n` is `retry_backoff * n`.
  pub retry_backoff: Duration,
  pub http_timeout: Duration,
  /// Download cache keyed by sha256; `None` disables it.
  pub cache_dir: Option<PathBuf>,
}

impl Default for StagerConfig {
  fn default() -> Self {
    StagerConfig {
      max_attempts: 3,
      retry_backoff: Duration::from_secs(2),
      http_timeout: Duration::from_secs(300),
      cache_dir: Some(downloads_dir()),
    }
  }
}

/// Stage one source into the workspace source root.
pub async fn stage(
  descriptor: &SourceDescriptor,
  workspace: &BuildWorkspace,
  config: &StagerConfig,
) -> Result<StagedSource, StageError> {
  descriptor.validate()?;
  let dest = workspace.srcdir().join(descriptor.target_path()?);
  info!(source = %descriptor.location(), dest = ?dest, "staging source");

  let resolved = match descriptor {
    SourceDescriptor::Directory { path, .. } => {
      if !path.is_dir() {
        return Err(StageError::InvalidDescriptor(format!(
          "directory '{}' does not exist",
          path.display()
        )));
      }
      let (src, dst) = (path.clone(), dest.clone());
      blocking(move || copy_dir_recursive(&src, &dst, &[".git"])).await?;
      None
    }

    SourceDescriptor::Archive { url, sha256, .. } => {
      let kind = ArchiveKind::from_name(url).ok_or_else(|| StageError::UnsupportedArchive(url.clone()))?;
      let archive = download_verified(url, Some(sha256), &workspace.downloads(), config).await?;

      let staging = tempfile::Builder::new()
        .prefix(".stage-")
        .tempdir_in(workspace.scratch())?;
      let staging_path = staging.path().to_path_buf();
      blocking(move || unpack_archive(&archive, kind, &staging_path)).await?;

      // Only a fully extracted tree is moved under the source root.
      move_into_place(&staging.keep(), &dest)?;
      Some(sha256.to_ascii_lowercase())
    }

    SourceDescriptor::File { url, sha256, .. } => {
      let downloaded = download_verified(url, sha256.as_deref(), &workspace.downloads(), config).await?;
      if dest.exists() {
        return Err(StageError::DestinationExists(dest));
      }
      if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::rename(&downloaded, &dest)?;
      match sha256 {
        Some(sha) => Some(sha.to_ascii_lowercase()),
        None => Some(hash_bytes(&fs::read(&dest)?).0),
      }
    }

    SourceDescriptor::Git { url, rev, .. } => Some(stage_git(url, rev, &dest, workspace, config).await?),
  };

  debug!(dest = ?dest, resolved = ?resolved, "source staged");
  Ok(StagedSource {
    descriptor: descriptor.clone(),
    path: dest,
    resolved,
  })
}

/// Stage every source in order, stopping at the first failure.
pub async fn stage_all(
  descriptors: &[SourceDescriptor],
  workspace: &BuildWorkspace,
  config: &StagerConfig,
) -> Result<Vec<StagedSource>, StageError> {
  let mut staged = Vec::with_capacity(descriptors.len());
  for descriptor in descriptors {
    staged.push(stage(descriptor, workspace, config).await?);
  }
  Ok(staged)
}

async fn stage_git(
  url: &str,
  rev: &str,
  dest: &Path,
  workspace: &BuildWorkspace,
  config: &StagerConfig,
) -> Result<String, StageError> {
  let clone_dir = workspace
    .scratch()
    .join("git")
    .join(&hash_bytes(url.as_bytes()).0[..16]);

  with_retries(url, config, || {
    let (url, clone_dir) = (url.to_string(), clone_dir.clone());
    async move {
      tokio::task::spawn_blocking(move || git::clone_bare(&url, &clone_dir).map(|_| ()))
        .await
        .map_err(|e| AttemptError::Transient(e.to_string()))?
    }
  })
  .await?;

  let (url, rev, dest) = (url.to_string(), rev.to_string(), dest.to_path_buf());
  blocking(move || {
    let repo = gix::open(&clone_dir).map_err(|e| StageError::Git {
      url: url.clone(),
      message: e.to_string(),
    })?;
    let commit = git::resolve_revision(&repo, &url, &rev)?;
    if dest.exists() && fs::read_dir(&dest)?.next().is_some() {
      return Err(StageError::DestinationExists(dest));
    }
    git::export_tree(&repo, &url, commit, &dest)?;
    info!(url = %url, rev = %rev, commit = %commit, "checked out revision");
    Ok(commit.to_string())
  })
  .await
}

/// Move the staged tree at `staging` to `dest`.
///
/// When `dest` already exists its entries are merged in, refusing to
/// overwrite anything.
fn move_into_place(staging: &Path, dest: &Path) -> Result<(), StageError> {
  if !dest.exists() {
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::rename(staging, dest)?;
    return Ok(());
  }

  let entries = fs::read_dir(staging)?.collect::<Result<Vec<_>, _>>()?;
  for entry in &entries {
    let target = dest.join(entry.file_name());
    if target.exists() {
      return Err(StageError::DestinationExists(target));
    }
  }
  for entry in entries {
    fs::rename(entry.path(), dest.join(entry.file_name()))?;
  }
  fs::remove_dir(staging)?;
  Ok(())
}

async fn blocking<T, E, F>(f: F) -> Result<T, StageError>
where
  F: FnOnce() -> Result<T, E> + Send + 'static,
  T: Send + 'static,
  E: Into<StageError> + Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| StageError::Io(io::Error::other(e)))?
    .map_err(Into::into)
}
