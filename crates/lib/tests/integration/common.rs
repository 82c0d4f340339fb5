//! Shared helpers for orchestrator integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbake_lib::audit::AuditPolicy;
use crossbake_lib::deps::DirectoryCatalog;
use crossbake_lib::package;
use crossbake_lib::platform::{Arch, Os};
use crossbake_lib::products::Product;
use crossbake_lib::runner::{Isolation, RunnerConfig, ToolchainImage, ToolchainRegistry};
use crossbake_lib::{BuildContext, BuildOptions, BuildRecipe, Platform};
use tempfile::TempDir;

/// The platform every test builds for. Scripts are plain shell, so the
/// actual machine does not matter.
pub fn linux() -> Platform {
  Platform::new(Arch::X86_64, Os::Linux)
}

/// Isolated build environment: catalog, toolchain, work and output
/// directories under one temp dir.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("catalog")).unwrap();
    std::fs::create_dir_all(temp.path().join("toolchain/bin")).unwrap();
    Self { temp }
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.temp.path().join(relative)
  }

  pub fn out_dir(&self) -> PathBuf {
    self.path("out")
  }

  pub fn work_dir(&self) -> PathBuf {
    self.path("work")
  }

  /// Context with an unconfined runner and a toolchain for [`linux`].
  pub fn context(&self) -> BuildContext {
    self.context_with(|_| {})
  }

  pub fn context_with(&self, adjust: impl FnOnce(&mut BuildOptions)) -> BuildContext {
    let mut options = BuildOptions {
      out_dir: self.out_dir(),
      work_dir: self.work_dir(),
      parallelism: 2,
      runner: RunnerConfig {
        isolation: Isolation::Unconfined,
        ..RunnerConfig::default()
      },
      ..BuildOptions::default()
    };
    options.stager.cache_dir = None;
    adjust(&mut options);

    let registry = ToolchainRegistry::new(vec![ToolchainImage::new(linux(), self.path("toolchain"))]);
    BuildContext::new(
      Arc::new(DirectoryCatalog::new(self.path("catalog"))),
      Arc::new(registry),
      Arc::new(AuditPolicy::default()),
      linux(),
      options,
    )
  }

  /// Package `files` as a prebuilt dependency and list it in the catalog.
  pub fn publish(&self, name: &str, platform: &Platform, files: &[(&str, &str)], products: &[Product]) {
    let prefix = TempDir::new().unwrap();
    for (relative, content) in files {
      write(prefix.path(), relative, content);
    }

    let dir = self.path("catalog").join(name);
    let artifact = package::package(prefix.path(), &dir, name, "1.0.0", platform).unwrap();

    let index = serde_json::json!({
      "version": "1.0.0",
      "artifacts": [{
        "platform": platform.triplet(),
        "archive": artifact.archive_path.file_name().unwrap().to_string_lossy(),
        "sha256": artifact.sha256.0,
        "products": products,
      }],
    });
    std::fs::write(dir.join("index.json"), serde_json::to_vec_pretty(&index).unwrap()).unwrap();
  }
}

pub fn write(root: &Path, relative: &str, content: &str) {
  let path = root.join(relative);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}

/// Recipe building `hello` for [`linux`] with `script`.
pub fn recipe(script: &str) -> BuildRecipe {
  BuildRecipe {
    name: "hello".to_string(),
    version: "1.0.0".to_string(),
    sources: Vec::new(),
    script: script.to_string(),
    platforms: vec![linux()],
    products: vec![Product::executable("hello", "hello")],
    dependencies: Vec::new(),
    preferred_compiler: None,
  }
}

/// Installs a shell script printing "hello" plus a license.
pub const HELLO_SCRIPT: &str = r#"
mkdir -p "$bindir" "$prefix/share/licenses/hello"
printf '#!/bin/sh\necho hello\n' > "$bindir/hello"
chmod +x "$bindir/hello"
echo MIT > "$prefix/share/licenses/hello/LICENSE"
"#;
