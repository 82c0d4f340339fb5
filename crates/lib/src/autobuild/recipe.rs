//! Build recipes.
//!
//! A recipe is a TOML document:
//!
//! ```toml
//! name = "zlib"
//! version = "1.3.1"
//! platforms = ["x86_64-linux-gnu", "aarch64-apple-darwin"]
//! script = """
//! cd $srcdir/zlib-1.3.1
//! ./configure --prefix=$prefix
//! make -j$nproc install
//! """
//!
//! [[sources]]
//! type = "archive"
//! url = "https://zlib.net/zlib-1.3.1.tar.gz"
//! sha256 = "9a93b2b7dfdac77ceba5a558a580e74667dd6fede4585b91eefb60f03b72df23"
//!
//! [[products]]
//! kind = "library"
//! name = "z"
//! symbol = "libz"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::BuildError;
use crate::deps::DependencyRequest;
use crate::platform::Platform;
use crate::products::Product;
use crate::sources::SourceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
  pub name: String,
  /// Strict `MAJOR.MINOR.PATCH`.
  pub version: String,
  #[serde(default)]
  pub sources: Vec<SourceDescriptor>,
  /// Shell script run once per platform under `/bin/sh -e`.
  pub script: String,
  pub platforms: Vec<Platform>,
  #[serde(default)]
  pub products: Vec<Product>,
  #[serde(default)]
  pub dependencies: Vec<DependencyRequest>,
  /// Compiler version to prefer when several toolchains match, e.g. `gcc-12`.
  #[serde(default)]
  pub preferred_compiler: Option<String>,
}

impl BuildRecipe {
  pub fn from_toml_str(content: &str) -> Result<Self, BuildError> {
    toml::from_str(content).map_err(|e| BuildError::Recipe {
      path: None,
      message: e.to_string(),
    })
  }

  pub fn from_toml_file(path: &Path) -> Result<Self, BuildError> {
    let content = fs::read_to_string(path).map_err(|e| BuildError::Recipe {
      path: Some(path.to_path_buf()),
      message: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| BuildError::Recipe {
      path: Some(path.to_path_buf()),
      message: e.to_string(),
    })
  }
}
