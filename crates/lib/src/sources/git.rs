//! Git sources: clone, resolve the pinned revision and export its tree.
//!
//! The repository is cloned bare into scratch space and the pinned commit's
//! tree is written out directly, so the staged checkout never contains a
//! `.git` directory.

use std::fs;
use std::path::Path;

use gix::bstr::ByteSlice;
use gix::objs::tree::EntryKind;
use tracing::{debug, info};

use super::StageError;
use super::download::AttemptError;
use crate::util::fs::normalize_relative;

/// Bare-clone `url` into `dest`.
///
/// Any failure here is treated as transient and left to the retry loop.
pub(crate) fn clone_bare(url: &str, dest: &Path) -> Result<gix::Repository, AttemptError> {
  if dest.exists() {
    fs::remove_dir_all(dest).map_err(|e| AttemptError::Transient(e.to_string()))?;
  }

  info!(url, path = ?dest, "cloning repository");
  let mut prepared = gix::prepare_clone_bare(url, dest).map_err(|e| AttemptError::Transient(e.to_string()))?;

  let (repo, _outcome) = prepared
    .fetch_only(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| AttemptError::Transient(e.to_string()))?;

  Ok(repo)
}

/// Resolve `rev` to a commit id.
pub(crate) fn resolve_revision(repo: &gix::Repository, url: &str, rev: &str) -> Result<gix::ObjectId, StageError> {
  let not_found = || StageError::RevisionNotFound {
    url: url.to_string(),
    rev: rev.to_string(),
  };

  let id = repo.rev_parse_single(rev).map_err(|_| not_found())?;
  let commit = id
    .object()
    .map_err(|_| not_found())?
    .peel_to_commit()
    .map_err(|_| not_found())?;

  // A full hash must name exactly that commit, not something it peels to.
  if rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit()) && !commit.id.to_string().eq_ignore_ascii_case(rev)
  {
    return Err(not_found());
  }

  Ok(commit.id)
}

/// Write the tree of `commit` into `dest`, honoring executable bits and symlinks.
///
/// Submodule entries are skipped.
pub(crate) fn export_tree(
  repo: &gix::Repository,
  url: &str,
  commit: gix::ObjectId,
  dest: &Path,
) -> Result<(), StageError> {
  let git_err = |e: &dyn std::fmt::Display| StageError::Git {
    url: url.to_string(),
    message: e.to_string(),
  };

  let tree = repo
    .find_object(commit)
    .map_err(|e| git_err(&e))?
    .peel_to_commit()
    .map_err(|e| git_err(&e))?
    .tree()
    .map_err(|e| git_err(&e))?;

  let mut recorder = gix::traverse::tree::Recorder::default();
  tree.traverse().breadthfirst(&mut recorder).map_err(|e| git_err(&e))?;

  fs::create_dir_all(dest)?;

  for entry in recorder.records {
    let relative = gix::path::from_bstr(entry.filepath.as_bstr());
    let relative = normalize_relative(&relative).ok_or_else(|| StageError::Git {
      url: url.to_string(),
      message: format!("tree entry '{}' escapes the checkout", entry.filepath),
    })?;
    let path = dest.join(relative);

    match entry.mode.kind() {
      EntryKind::Tree => fs::create_dir_all(&path)?,
      EntryKind::Blob | EntryKind::BlobExecutable => {
        let blob = repo.find_object(entry.oid).map_err(|e| git_err(&e))?;
        if let Some(parent) = path.parent() {
          fs::create_dir_all(parent)?;
        }
        fs::write(&path, &blob.data)?;
        #[cfg(unix)]
        {
          use std::os::unix::fs::PermissionsExt;
          let mode = if matches!(entry.mode.kind(), EntryKind::BlobExecutable) {
            0o755
          } else {
            0o644
          };
          fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
      }
      EntryKind::Link => {
        let blob = repo.find_object(entry.oid).map_err(|e| git_err(&e))?;
        let target = gix::path::from_bstr(blob.data.as_bstr());
        if let Some(parent) = path.parent() {
          fs::create_dir_all(parent)?;
        }
        crate::util::fs::symlink(&target, &path)?;
      }
      EntryKind::Commit => {
        debug!(path = ?path, "skipping submodule entry");
      }
    }
  }

  Ok(())
}
