//! Toolchain images and their selection.
//!
//! Toolchains are opaque directories on the build host. A registry lists
//! them per target platform; the runner picks one per attempt and exposes
//! its compilers to the build script through small wrapper scripts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RunError;
use crate::platform::{Os, Platform};

/// Tool aliases exported to build scripts, as `(variable, wrapper name)`.
pub const TOOL_ALIASES: &[(&str, &str)] = &[
  ("CC", "cc"),
  ("CXX", "c++"),
  ("FC", "gfortran"),
  ("AR", "ar"),
  ("AS", "as"),
  ("LD", "ld"),
  ("NM", "nm"),
  ("OBJCOPY", "objcopy"),
  ("OBJDUMP", "objdump"),
  ("RANLIB", "ranlib"),
  ("STRIP", "strip"),
];

/// A cross toolchain for one target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainImage {
  /// Platform the toolchain produces binaries for.
  pub platform: Platform,
  /// Host directory holding the toolchain.
  pub root: PathBuf,
  /// e.g. `gcc-12`; used to honor a recipe's preferred compiler.
  #[serde(default)]
  pub compiler_version: Option<String>,
  /// Directory of executables, relative to `root`.
  #[serde(default = "default_bin_dir")]
  pub bin_dir: PathBuf,
  /// Prefix of the cross tools; defaults to the platform triplet.
  #[serde(default)]
  pub tool_prefix: Option<String>,
  /// Per-wrapper overrides of the executable name (`cc` → `clang`).
  #[serde(default)]
  pub tools: BTreeMap<String, String>,
}

fn default_bin_dir() -> PathBuf {
  PathBuf::from("bin")
}

impl ToolchainImage {
  pub fn new(platform: Platform, root: impl Into<PathBuf>) -> Self {
    ToolchainImage {
      platform,
      root: root.into(),
      compiler_version: None,
      bin_dir: default_bin_dir(),
      tool_prefix: None,
      tools: BTreeMap::new(),
    }
  }

  /// Executable name behind the wrapper `alias`, without the bin directory.
  pub fn tool_name(&self, alias: &str) -> String {
    if let Some(name) = self.tools.get(alias) {
      return name.clone();
    }

    let clang = matches!(self.platform.os(), Some(Os::MacOs | Os::FreeBsd));
    let base = match alias {
      "cc" if clang => "clang",
      "c++" if clang => "clang++",
      "cc" => "gcc",
      "c++" => "g++",
      other => other,
    };
    let prefix = self
      .tool_prefix
      .clone()
      .unwrap_or_else(|| self.platform.triplet());
    format!("{}-{}", prefix, base)
  }
}

/// All toolchains known to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainRegistry {
  pub images: Vec<ToolchainImage>,
}

impl ToolchainRegistry {
  pub fn new(images: Vec<ToolchainImage>) -> Self {
    ToolchainRegistry { images }
  }

  /// Load a registry from a JSON file. Relative image roots are resolved
  /// against the file's directory.
  pub fn from_json_file(path: &Path) -> Result<Self, RunError> {
    let content = fs::read_to_string(path).map_err(|e| RunError::Registry {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    let mut registry: ToolchainRegistry = serde_json::from_str(&content).map_err(|e| RunError::Registry {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;

    let base = path.parent().unwrap_or(Path::new("."));
    for image in &mut registry.images {
      if image.root.is_relative() {
        image.root = base.join(&image.root);
      }
    }
    Ok(registry)
  }

  /// Pick the toolchain for `platform`.
  ///
  /// Exact platform matches win over compatible ones; among those, an image
  /// whose compiler version equals `preferred` wins.
  pub fn select(&self, platform: &Platform, preferred: Option<&str>) -> Option<&ToolchainImage> {
    let rank = |image: &ToolchainImage| {
      let exact = &image.platform == platform;
      let preferred_match = preferred.is_some() && image.compiler_version.as_deref() == preferred;
      (exact, preferred_match)
    };

    let chosen = self
      .images
      .iter()
      .filter(|image| !image.platform.is_any() && image.platform.is_compatible(platform))
      .enumerate()
      // Stable: earlier registry entries win ties.
      .max_by(|(ia, a), (ib, b)| rank(*a).cmp(&rank(*b)).then(ib.cmp(ia)))
      .map(|(_, image)| image);

    if let Some(image) = chosen {
      debug!(platform = %platform, toolchain = ?image.root, compiler = ?image.compiler_version, "selected toolchain");
    }
    chosen
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::{Arch, GfortranVersion};
  use crate::util::testutil::write_file;
  use tempfile::TempDir;

  fn linux() -> Platform {
    Platform::new(Arch::X86_64, Os::Linux)
  }

  fn image(platform: Platform, root: &str, compiler: Option<&str>) -> ToolchainImage {
    ToolchainImage {
      compiler_version: compiler.map(String::from),
      ..ToolchainImage::new(platform, root)
    }
  }

  #[test]
  fn tool_names_follow_platform_conventions() {
    let gnu = ToolchainImage::new(linux(), "/tc");
    assert_eq!(gnu.tool_name("cc"), "x86_64-linux-gnu-gcc");
    assert_eq!(gnu.tool_name("ar"), "x86_64-linux-gnu-ar");

    let mac = ToolchainImage::new(Platform::new(Arch::Aarch64, Os::MacOs), "/tc");
    assert_eq!(mac.tool_name("c++"), "aarch64-apple-darwin-clang++");

    let mut custom = ToolchainImage::new(linux(), "/tc");
    custom.tools.insert("cc".into(), "clang-17".into());
    assert_eq!(custom.tool_name("cc"), "clang-17");
  }

  #[test]
  fn selection_prefers_exact_then_preferred_compiler() {
    let expanded = linux().with_libgfortran_version(GfortranVersion(5));
    let registry = ToolchainRegistry::new(vec![
      image(linux(), "/generic-gcc9", Some("gcc-9")),
      image(linux(), "/generic-gcc12", Some("gcc-12")),
      image(expanded.clone(), "/gfortran5", None),
    ]);

    assert_eq!(registry.select(&linux(), None).unwrap().root, PathBuf::from("/generic-gcc9"));
    assert_eq!(
      registry.select(&linux(), Some("gcc-12")).unwrap().root,
      PathBuf::from("/generic-gcc12")
    );
    assert_eq!(registry.select(&expanded, None).unwrap().root, PathBuf::from("/gfortran5"));
    assert!(registry.select(&Platform::new(Arch::Aarch64, Os::Linux), None).is_none());
  }

  #[test]
  fn loads_registry_with_relative_roots() {
    let dir = TempDir::new().unwrap();
    write_file(
      dir.path(),
      "toolchains.json",
      br#"{ "images": [ { "platform": "x86_64-linux-gnu", "root": "images/x86_64" } ] }"#,
    );

    let registry = ToolchainRegistry::from_json_file(&dir.path().join("toolchains.json")).unwrap();
    assert_eq!(registry.images[0].root, dir.path().join("images/x86_64"));
    assert_eq!(registry.images[0].bin_dir, PathBuf::from("bin"));
  }
}
