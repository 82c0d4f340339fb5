//! Deterministic packaging of an install prefix and its inverse.
//!
//! Archives are gzip-compressed tarballs named
//! `<name>.v<version>.<triplet>.tar.gz`. Packaging the same tree twice yields
//! byte-identical archives: entries are sorted, timestamps and ownership are
//! zeroed and modes are normalized to `0o755`/`0o644`. The archive sha256 is
//! the only thing consumers need to trust.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use serde::Serialize;
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::platform::Platform;
use crate::util::fs::normalize_relative;
use crate::util::hash::{ContentHash, HashError, hash_directory, hash_file, is_executable};

#[derive(Debug, Error)]
pub enum PackageError {
  #[error("hash mismatch for '{archive}': expected {expected}, got {actual}")]
  HashMismatch {
    archive: PathBuf,
    expected: String,
    actual: String,
  },

  #[error("archive entry '{0}' escapes the destination")]
  UnsafeEntry(String),

  #[error("prefix does not exist: {0}")]
  MissingPrefix(PathBuf),

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
}

/// A packaged platform build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagedArtifact {
  pub name: String,
  pub version: String,
  pub platform: Platform,
  pub archive_path: PathBuf,
  /// sha256 of the archive bytes.
  pub sha256: ContentHash,
  pub size: u64,
  /// Content hash of the packaged tree, independent of archive encoding.
  pub tree_hash: ContentHash,
}

pub fn archive_name(name: &str, version: &str, platform: &Platform) -> String {
  format!("{}.v{}.{}.tar.gz", name, version, platform.triplet())
}

/// Package `prefix` into `out_dir`.
pub fn package(
  prefix: &Path,
  out_dir: &Path,
  name: &str,
  version: &str,
  platform: &Platform,
) -> Result<PackagedArtifact, PackageError> {
  if !prefix.is_dir() {
    return Err(PackageError::MissingPrefix(prefix.to_path_buf()));
  }
  fs::create_dir_all(out_dir)?;

  let archive_path = out_dir.join(archive_name(name, version, platform));
  let staging = tempfile::NamedTempFile::new_in(out_dir)?;

  {
    let encoder = GzBuilder::new()
      .mtime(0)
      .operating_system(255)
      .write(BufWriter::new(staging.as_file()), Compression::best());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    append_tree(&mut builder, prefix)?;
    builder.into_inner()?.finish()?.flush()?;
  }

  staging.persist(&archive_path).map_err(|e| e.error)?;

  let sha256 = hash_file(&archive_path)?;
  let size = fs::metadata(&archive_path)?.len();
  let tree_hash = hash_directory(prefix, &[])?;

  info!(archive = ?archive_path, sha256 = %sha256, size, "packaged");
  Ok(PackagedArtifact {
    name: name.to_string(),
    version: version.to_string(),
    platform: platform.clone(),
    archive_path,
    sha256,
    size,
    tree_hash,
  })
}

fn append_tree<W: Write>(builder: &mut Builder<W>, prefix: &Path) -> Result<(), PackageError> {
  for entry in WalkDir::new(prefix).sort_by_file_name().follow_links(false) {
    let entry = entry.map_err(|e| HashError::WalkDir { message: e.to_string() })?;
    let relative = entry.path().strip_prefix(prefix).map_err(io::Error::other)?;
    if relative.as_os_str().is_empty() {
      continue;
    }

    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;

    let file_type = entry.file_type();
    if file_type.is_symlink() {
      let target = fs::read_link(entry.path())?;
      header.set_entry_type(EntryType::Symlink);
      header.set_mode(0o755);
      header.set_size(0);
      builder.append_link(&mut header, relative, &target)?;
    } else if file_type.is_dir() {
      header.set_entry_type(EntryType::Directory);
      header.set_mode(0o755);
      header.set_size(0);
      builder.append_data(&mut header, relative, io::empty())?;
    } else {
      let metadata = entry.metadata().map_err(io::Error::other)?;
      header.set_entry_type(EntryType::Regular);
      header.set_mode(if is_executable(entry.path()) { 0o755 } else { 0o644 });
      header.set_size(metadata.len());
      let file = BufReader::new(File::open(entry.path())?);
      builder.append_data(&mut header, relative, file)?;
    }
  }
  Ok(())
}

/// Verify `archive` against `expected_sha256` and extract it into `dest_prefix`.
///
/// Nothing is extracted when the hash does not match.
pub fn install(archive: &Path, expected_sha256: &str, dest_prefix: &Path) -> Result<(), PackageError> {
  let actual = hash_file(archive)?;
  if !actual.matches(expected_sha256) {
    return Err(PackageError::HashMismatch {
      archive: archive.to_path_buf(),
      expected: expected_sha256.to_string(),
      actual: actual.0,
    });
  }

  fs::create_dir_all(dest_prefix)?;
  let mut tar = Archive::new(GzDecoder::new(BufReader::new(File::open(archive)?)));
  tar.set_preserve_permissions(true);

  for entry in tar.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.into_owned();
    let display = path.display().to_string();

    let relative = normalize_relative(&path).ok_or_else(|| PackageError::UnsafeEntry(display.clone()))?;
    if relative.as_os_str().is_empty() {
      continue;
    }

    if entry.header().entry_type().is_symlink() {
      let target = entry
        .link_name()?
        .ok_or_else(|| PackageError::UnsafeEntry(display.clone()))?;
      let parent = relative.parent().unwrap_or(Path::new(""));
      if target.is_absolute() || normalize_relative(&parent.join(&target)).is_none() {
        return Err(PackageError::UnsafeEntry(display));
      }
    }

    if !entry.unpack_in(dest_prefix)? {
      return Err(PackageError::UnsafeEntry(display));
    }
  }

  debug!(archive = ?archive, dest = ?dest_prefix, "installed");
  Ok(())
}
