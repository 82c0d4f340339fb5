//! Filesystem helpers shared by the stager, resolver and packager.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Recursively copy `src` into `dest`, preserving permissions and symlinks.
///
/// Entries named in `skip` (matched on file name, at any depth) are left out.
pub fn copy_dir_recursive(src: &Path, dest: &Path, skip: &[&str]) -> io::Result<()> {
  fs::create_dir_all(dest)?;

  let walker = WalkDir::new(src).sort_by_file_name().into_iter().filter_entry(|e| {
    e.depth() == 0
      || e
        .file_name()
        .to_str()
        .map(|name| !skip.contains(&name))
        .unwrap_or(true)
  });

  // Directory modes are applied last so read-only directories can still be filled.
  let mut dir_modes = Vec::new();

  for entry in walker {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dest.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
      dir_modes.push((target, entry.metadata().map_err(io::Error::other)?.permissions()));
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path())?;
      symlink(&link, &target)?;
    } else if file_type.is_file() {
      // fs::copy carries the permission bits over.
      fs::copy(entry.path(), &target)?;
    }
  }

  for (dir, perms) in dir_modes.into_iter().rev() {
    fs::set_permissions(dir, perms)?;
  }

  Ok(())
}

#[cfg(unix)]
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
  if resolved.is_dir() {
    std::os::windows::fs::symlink_dir(target, link)
  } else {
    std::os::windows::fs::symlink_file(target, link)
  }
}

/// Lexically normalize a relative path, rejecting anything that escapes its root.
///
/// Returns `None` for absolute paths or paths whose `..` components climb
/// above the starting directory.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::Normal(part) => out.push(part),
      Component::CurDir => {}
      Component::ParentDir => {
        if !out.pop() {
          return None;
        }
      }
      Component::RootDir | Component::Prefix(_) => return None,
    }
  }
  Some(out)
}

/// Relative path from directory `from` to `to`, both relative to the same root.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
  let from: Vec<_> = from.components().collect();
  let to: Vec<_> = to.components().collect();
  let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

  let mut out = PathBuf::new();
  for _ in common..from.len() {
    out.push("..");
  }
  for part in &to[common..] {
    out.push(part.as_os_str());
  }
  out
}
