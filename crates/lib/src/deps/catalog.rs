//! Dependency catalogs.
//!
//! A catalog answers "which prebuilt archive of package X matches platform
//! Y". [`DirectoryCatalog`] reads a directory of per-package indexes:
//!
//! ```text
//! <root>/
//! └── zlib/
//!     ├── index.json
//!     └── zlib.v1.3.1.x86_64-linux-gnu.tar.gz
//! ```
//!
//! where `index.json` looks like
//!
//! ```json
//! {
//!   "version": "1.3.1",
//!   "artifacts": [
//!     {
//!       "platform": "x86_64-linux-gnu",
//!       "archive": "zlib.v1.3.1.x86_64-linux-gnu.tar.gz",
//!       "sha256": "…",
//!       "products": [{ "kind": "library", "name": "z", "symbol": "libz" }]
//!     }
//!   ]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::platform::Platform;
use crate::products::Product;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
  #[error("unknown package '{0}'")]
  UnknownPackage(String),

  #[error("no artifact of '{package}' matches {platform}")]
  NoMatchingArtifact { package: String, platform: Platform },

  #[error("unreadable catalog index '{path}': {message}")]
  Index { path: PathBuf, message: String },
}

/// One prebuilt archive offered by a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogArtifact {
  pub package: String,
  pub version: String,
  pub platform: Platform,
  /// Absolute path of the archive.
  pub archive: PathBuf,
  pub sha256: String,
  pub products: Vec<Product>,
}

/// Source of prebuilt dependency artifacts.
pub trait DependencyCatalog: Send + Sync {
  /// Find the artifact of `package` best matching `platform`.
  fn lookup(&self, package: &str, platform: &Platform) -> Result<CatalogArtifact, LookupError>;
}

#[derive(Debug, Deserialize)]
struct PackageIndex {
  version: String,
  artifacts: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
  platform: Platform,
  archive: PathBuf,
  sha256: String,
  #[serde(default)]
  products: Vec<Product>,
}

/// Catalog backed by a directory of `index.json` files.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
  root: PathBuf,
}

impl DirectoryCatalog {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    DirectoryCatalog { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn load_index(&self, package: &str) -> Result<(PathBuf, PackageIndex), LookupError> {
    // Package names never contain path separators.
    if package.is_empty() || package.contains(['/', '\\']) || package == "." || package == ".." {
      return Err(LookupError::UnknownPackage(package.to_string()));
    }

    let dir = self.root.join(package);
    let path = dir.join("index.json");
    if !path.is_file() {
      return Err(LookupError::UnknownPackage(package.to_string()));
    }

    let content = fs::read_to_string(&path).map_err(|e| LookupError::Index {
      path: path.clone(),
      message: e.to_string(),
    })?;
    let index = serde_json::from_str(&content).map_err(|e| LookupError::Index {
      path: path.clone(),
      message: e.to_string(),
    })?;
    Ok((dir, index))
  }
}

impl DependencyCatalog for DirectoryCatalog {
  fn lookup(&self, package: &str, platform: &Platform) -> Result<CatalogArtifact, LookupError> {
    let (dir, index) = self.load_index(package)?;

    // An exact triplet beats a merely compatible one.
    let entry = index
      .artifacts
      .iter()
      .find(|a| &a.platform == platform)
      .or_else(|| index.artifacts.iter().find(|a| a.platform.is_compatible(platform)))
      .ok_or_else(|| LookupError::NoMatchingArtifact {
        package: package.to_string(),
        platform: platform.clone(),
      })?;

    debug!(package, platform = %platform, artifact = %entry.platform, "catalog match");
    Ok(CatalogArtifact {
      package: package.to_string(),
      version: index.version.clone(),
      platform: entry.platform.clone(),
      archive: dir.join(&entry.archive),
      sha256: entry.sha256.clone(),
      products: entry.products.clone(),
    })
  }
}
