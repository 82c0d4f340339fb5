//! Archive extraction.
//!
//! Supports:
//! - `.tar.gz` / `.tgz`
//! - `.tar`
//! - `.zip`
//!
//! Entries are unpacked verbatim (no component stripping); entries whose
//! path would land outside the destination are rejected.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use super::StageError;
use crate::util::fs::normalize_relative;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
  TarGz,
  Tar,
  Zip,
}

impl ArchiveKind {
  /// Detect the archive kind from a file name or URL.
  pub fn from_name(name: &str) -> Option<Self> {
    let name = name.split('?').next().unwrap_or(name);
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar") {
      Some(ArchiveKind::Tar)
    } else if name.ends_with(".zip") {
      Some(ArchiveKind::Zip)
    } else {
      None
    }
  }
}

/// Unpack `archive_path` into `dest`, which is created if missing.
pub fn unpack_archive(archive_path: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), StageError> {
  fs::create_dir_all(dest)?;

  let result = match kind {
    ArchiveKind::TarGz => {
      let file = File::open(archive_path)?;
      unpack_tar(GzDecoder::new(BufReader::new(file)), dest)
    }
    ArchiveKind::Tar => unpack_tar(BufReader::new(File::open(archive_path)?), dest),
    ArchiveKind::Zip => unpack_zip(archive_path, dest),
  };

  result.map_err(|message| StageError::Extract {
    archive: archive_path.to_path_buf(),
    message,
  })?;

  debug!(archive = ?archive_path, dest = ?dest, "unpacked");
  Ok(())
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<(), String> {
  let mut archive = Archive::new(reader);
  archive.set_preserve_permissions(true);
  archive.set_preserve_mtime(true);

  for entry in archive.entries().map_err(|e| e.to_string())? {
    let mut entry = entry.map_err(|e| e.to_string())?;
    let path = entry.path().map_err(|e| e.to_string())?.into_owned();

    let Some(relative) = normalize_relative(&path) else {
      return Err(format!("entry '{}' escapes the extraction root", path.display()));
    };
    if relative.as_os_str().is_empty() {
      continue;
    }

    // unpack_in refuses entries that would write through a symlink out of dest.
    if !entry.unpack_in(dest).map_err(|e| e.to_string())? {
      return Err(format!("entry '{}' escapes the extraction root", path.display()));
    }
  }

  Ok(())
}

fn unpack_zip(archive_path: &Path, dest: &Path) -> Result<(), String> {
  let file = File::open(archive_path).map_err(|e| e.to_string())?;
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| format!("failed to open zip: {}", e))?;

  for i in 0..archive.len() {
    let mut file = archive
      .by_index(i)
      .map_err(|e| format!("failed to read zip entry: {}", e))?;

    let path = file
      .enclosed_name()
      .ok_or_else(|| format!("entry '{}' escapes the extraction root", file.name()))?;

    let dest_path = dest.join(&path);

    if file.is_dir() {
      fs::create_dir_all(&dest_path).map_err(|e| e.to_string())?;
    } else {
      if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
      }

      let mut outfile = File::create(&dest_path).map_err(|e| e.to_string())?;
      std::io::copy(&mut file, &mut outfile).map_err(|e| e.to_string())?;

      #[cfg(unix)]
      {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = file.unix_mode() {
          fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode & 0o7777)).map_err(|e| e.to_string())?;
        }
      }
    }
  }

  Ok(())
}
