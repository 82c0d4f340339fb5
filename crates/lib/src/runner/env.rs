//! The environment contract between the runner and build scripts.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::toolchain::{TOOL_ALIASES, ToolchainImage};
use crate::consts::SOURCE_DATE_EPOCH;
use crate::platform::Platform;
use crate::workspace::BuildWorkspace;

/// Translates host paths to the paths the build script sees.
#[derive(Debug, Clone, Default)]
pub struct PathMap {
  mounts: Vec<(PathBuf, PathBuf)>,
}

impl PathMap {
  /// Paths are seen unchanged.
  pub fn identity() -> Self {
    PathMap::default()
  }

  pub fn with_mount(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
    self.mounts.push((host.into(), guest.into()));
    // Longest host prefix first so nested mounts win.
    self
      .mounts
      .sort_by(|(a, _), (b, _)| b.components().count().cmp(&a.components().count()));
    self
  }

  pub fn map(&self, host: &Path) -> PathBuf {
    for (from, to) in &self.mounts {
      if let Ok(rest) = host.strip_prefix(from) {
        return if rest.as_os_str().is_empty() {
          to.clone()
        } else {
          to.join(rest)
        };
      }
    }
    host.to_path_buf()
  }

  fn show(&self, host: &Path) -> String {
    self.map(host).to_string_lossy().to_string()
  }
}

/// Everything the environment is derived from.
pub struct EnvInputs<'a> {
  pub workspace: &'a BuildWorkspace,
  /// Concrete platform the script builds for.
  pub platform: &'a Platform,
  pub host: &'a Platform,
  pub nproc: usize,
  pub toolchain: &'a ToolchainImage,
  pub host_toolchain: Option<&'a ToolchainImage>,
  pub dependency_exports: &'a [(String, PathBuf)],
  pub paths: &'a PathMap,
}

/// Build the complete, cleared environment for a build script.
pub fn build_environment(inputs: &EnvInputs<'_>) -> BTreeMap<String, String> {
  let ws = inputs.workspace;
  let paths = inputs.paths;
  let prefix = ws.prefix();
  let host_prefix = ws.host_deps();

  let libdir = if inputs.platform.is_windows() {
    prefix.join("bin")
  } else {
    prefix.join("lib")
  };

  let mut env = BTreeMap::new();
  let mut set = |key: &str, value: String| {
    env.insert(key.to_string(), value);
  };

  set("prefix", paths.show(&prefix));
  set("WORKSPACE", paths.show(ws.root()));
  set("srcdir", paths.show(&ws.srcdir()));
  set("target", inputs.platform.triplet());
  set("MACHTYPE", inputs.host.triplet());
  set("host_target", inputs.host.triplet());
  set("nproc", inputs.nproc.to_string());
  set("bindir", paths.show(&prefix.join("bin")));
  set("libdir", paths.show(&libdir));
  set("includedir", paths.show(&prefix.join("include")));
  set("host_prefix", paths.show(&host_prefix));
  set("host_bindir", paths.show(&host_prefix.join("bin")));
  set("target_deps_prefix", paths.show(&ws.target_deps()));

  for &(var, alias) in TOOL_ALIASES {
    set(var, alias.to_string());
  }
  set(
    "HOSTCC",
    if inputs.host_toolchain.is_some() {
      "host-cc".to_string()
    } else {
      "/usr/bin/cc".to_string()
    },
  );

  let path = [
    paths.show(&ws.tool_bin()),
    paths.show(&host_prefix.join("bin")),
    paths.show(&toolchain_bin(inputs.toolchain, paths)),
    "/usr/local/bin".to_string(),
    "/usr/bin".to_string(),
    "/bin".to_string(),
  ]
  .join(":");
  set("PATH", path);
  set("HOME", paths.show(&ws.home()));
  set("TMPDIR", paths.show(&ws.tmp()));
  set("LANG", "C".to_string());
  set("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH.to_string());

  for (name, path) in inputs.dependency_exports {
    set(name, paths.show(path));
  }

  trace!(vars = env.len(), "built script environment");
  env
}

/// Directory of the toolchain's executables as the script sees it.
fn toolchain_bin(toolchain: &ToolchainImage, paths: &PathMap) -> PathBuf {
  paths.map(&toolchain.root.join(&toolchain.bin_dir))
}

/// Write `cc`, `ar`, ... wrappers into the workspace tool directory.
pub fn write_tool_wrappers(
  workspace: &BuildWorkspace,
  toolchain: &ToolchainImage,
  host_toolchain: Option<&ToolchainImage>,
  paths: &PathMap,
) -> io::Result<()> {
  let dir = workspace.tool_bin();
  fs::create_dir_all(&dir)?;

  let bin = toolchain_bin(toolchain, paths);
  for &(_, alias) in TOOL_ALIASES {
    write_wrapper(&dir.join(alias), &bin.join(toolchain.tool_name(alias)))?;
  }

  if let Some(host) = host_toolchain {
    let host_bin = toolchain_bin(host, paths);
    write_wrapper(&dir.join("host-cc"), &host_bin.join(host.tool_name("cc")))?;
  }
  Ok(())
}

fn write_wrapper(path: &Path, target: &Path) -> io::Result<()> {
  let script = format!("#!/bin/sh\nexec {} \"$@\"\n", shell_quote(&target.to_string_lossy()));
  fs::write(path, script)?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
  }
  Ok(())
}

/// Single-quote `value` for `/bin/sh`.
fn shell_quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', "'\\''"))
}
