//! Per-attempt build workspace.
//!
//! Each (package, platform) attempt gets a fresh directory:
//!
//! ```text
//! <root>/
//! ├── srcdir/        staged sources, working directory of the build script
//! ├── destdir/       install prefix the script populates
//! ├── deps/target/   dependency artifacts built for the target
//! ├── deps/host/     dependency artifacts runnable on the build host
//! └── scratch/       downloads, tool wrappers, HOME and TMPDIR
//! ```
//!
//! The directory is removed when the workspace is dropped unless
//! [`BuildWorkspace::retain`] was called.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::platform::Platform;

#[derive(Debug)]
pub struct BuildWorkspace {
  root: PathBuf,
  guard: Option<TempDir>,
}

impl BuildWorkspace {
  /// Create a fresh workspace under `base` for building `package` for `platform`.
  pub fn create(base: &Path, package: &str, platform: &Platform) -> io::Result<Self> {
    fs::create_dir_all(base)?;
    let guard = tempfile::Builder::new()
      .prefix(&format!("{}-{}-", package, platform.triplet()))
      .tempdir_in(base)?;
    let root = guard.path().to_path_buf();

    let ws = BuildWorkspace {
      root,
      guard: Some(guard),
    };
    for dir in [
      ws.srcdir(),
      ws.prefix(),
      ws.target_deps(),
      ws.host_deps(),
      ws.scratch(),
      ws.tool_bin(),
      ws.home(),
      ws.tmp(),
    ] {
      fs::create_dir_all(dir)?;
    }

    debug!(root = ?ws.root, "created build workspace");
    Ok(ws)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn srcdir(&self) -> PathBuf {
    self.root.join("srcdir")
  }

  /// The install prefix (`$prefix`).
  pub fn prefix(&self) -> PathBuf {
    self.root.join("destdir")
  }

  pub fn target_deps(&self) -> PathBuf {
    self.root.join("deps").join("target")
  }

  pub fn host_deps(&self) -> PathBuf {
    self.root.join("deps").join("host")
  }

  pub fn scratch(&self) -> PathBuf {
    self.root.join("scratch")
  }

  pub fn downloads(&self) -> PathBuf {
    self.scratch().join("downloads")
  }

  /// Directory holding the toolchain alias wrappers (`cc`, `ar`, ...).
  pub fn tool_bin(&self) -> PathBuf {
    self.scratch().join("bin")
  }

  pub fn home(&self) -> PathBuf {
    self.scratch().join("home")
  }

  pub fn tmp(&self) -> PathBuf {
    self.scratch().join("tmp")
  }

  /// Keep the workspace on disk after drop and return its location.
  pub fn retain(&mut self) -> PathBuf {
    if let Some(guard) = self.guard.take() {
      let root = guard.keep();
      info!(path = ?root, "retaining build workspace");
    }
    self.root.clone()
  }

  pub fn is_retained(&self) -> bool {
    self.guard.is_none()
  }
}
