//! Declared build products and how to find them inside an install prefix.
//!
//! Products carry a logical name and a symbol. The symbol is the variable
//! name under which a located product is exported to dependent builds
//! (`dep_<symbol>`).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::platform::{Os, Platform};
use crate::util::fs::normalize_relative;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductError {
  #[error("missing products: {}", .missing.join(", "))]
  MissingProducts { missing: Vec<String> },

  #[error("product {0} is platform-specific and cannot be located for 'any'")]
  IllegalForAny(String),
}

/// A build product declared by a recipe or a dependency artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Product {
  /// A shared library, named without the `lib` prefix or extension.
  Library { name: String, symbol: String },
  Executable { name: String, symbol: String },
  /// An Apple framework bundle.
  Framework { name: String, symbol: String },
  /// Any file, by path relative to the prefix.
  File { path: String, symbol: String },
}

/// A product found inside a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedProduct {
  pub product: Product,
  /// Path relative to the prefix.
  pub relative: PathBuf,
}

impl Product {
  pub fn library(name: &str, symbol: &str) -> Self {
    Product::Library {
      name: name.to_string(),
      symbol: symbol.to_string(),
    }
  }

  pub fn executable(name: &str, symbol: &str) -> Self {
    Product::Executable {
      name: name.to_string(),
      symbol: symbol.to_string(),
    }
  }

  pub fn framework(name: &str, symbol: &str) -> Self {
    Product::Framework {
      name: name.to_string(),
      symbol: symbol.to_string(),
    }
  }

  pub fn file(path: &str, symbol: &str) -> Self {
    Product::File {
      path: path.to_string(),
      symbol: symbol.to_string(),
    }
  }

  pub fn name(&self) -> &str {
    match self {
      Product::Library { name, .. } | Product::Executable { name, .. } | Product::Framework { name, .. } => name,
      Product::File { path, .. } => path,
    }
  }

  pub fn symbol(&self) -> &str {
    match self {
      Product::Library { symbol, .. }
      | Product::Executable { symbol, .. }
      | Product::Framework { symbol, .. }
      | Product::File { symbol, .. } => symbol,
    }
  }

  /// Whether locating this product requires a concrete platform.
  pub fn is_platform_specific(&self) -> bool {
    !matches!(self, Product::File { .. })
  }

  /// Find this product under `prefix`, returning its absolute path.
  ///
  /// Symlinks are followed; the result is always a regular file (or, for
  /// [`Product::File`], an existing path) inside the prefix.
  pub fn locate(&self, prefix: &Path, platform: &Platform) -> Option<PathBuf> {
    if platform.is_any() && self.is_platform_specific() {
      return None;
    }

    let found = match self {
      Product::File { path, .. } => {
        let relative = normalize_relative(Path::new(path))?;
        let candidate = prefix.join(relative);
        candidate.exists().then_some(candidate)
      }
      Product::Executable { name, .. } => ["bin", "sbin", "libexec"]
        .iter()
        .map(|dir| prefix.join(dir).join(format!("{}{}", name, platform.exe_suffix())))
        .find_map(|candidate| regular_file_inside(prefix, &candidate)),
      Product::Library { name, .. } => locate_library(prefix, name, platform),
      Product::Framework { name, .. } => locate_framework(prefix, name, platform),
    };

    match &found {
      Some(path) => trace!(product = %self, path = ?path, "located product"),
      None => debug!(product = %self, prefix = ?prefix, "product not found"),
    }
    found
  }
}

impl fmt::Display for Product {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Product::Library { name, .. } => write!(f, "library '{}'", name),
      Product::Executable { name, .. } => write!(f, "executable '{}'", name),
      Product::Framework { name, .. } => write!(f, "framework '{}'", name),
      Product::File { path, .. } => write!(f, "file '{}'", path),
    }
  }
}

/// Locate every product, reporting all that are missing at once.
pub fn locate_all(
  products: &[Product],
  prefix: &Path,
  platform: &Platform,
) -> Result<Vec<LocatedProduct>, ProductError> {
  if platform.is_any()
    && let Some(product) = products.iter().find(|p| p.is_platform_specific())
  {
    return Err(ProductError::IllegalForAny(product.to_string()));
  }

  let mut located = Vec::with_capacity(products.len());
  let mut missing = Vec::new();

  for product in products {
    match product.locate(prefix, platform) {
      Some(path) => {
        let relative = path
          .strip_prefix(prefix)
          .map(Path::to_path_buf)
          .unwrap_or_else(|_| path.clone());
        located.push(LocatedProduct {
          product: product.clone(),
          relative,
        });
      }
      None => missing.push(product.to_string()),
    }
  }

  if missing.is_empty() {
    Ok(located)
  } else {
    Err(ProductError::MissingProducts { missing })
  }
}

/// Resolve `candidate` through symlinks, keeping it only if it is a regular
/// file inside `prefix`. The returned path is relative-stable: it is
/// `prefix` joined with the resolved location.
fn regular_file_inside(prefix: &Path, candidate: &Path) -> Option<PathBuf> {
  let real_prefix = dunce::canonicalize(prefix).ok()?;
  let real = dunce::canonicalize(candidate).ok()?;
  let relative = real.strip_prefix(&real_prefix).ok()?;
  fs::metadata(&real).ok()?.is_file().then(|| prefix.join(relative))
}

fn library_base(name: &str) -> &str {
  name.strip_prefix("lib").filter(|rest| !rest.is_empty()).unwrap_or(name)
}

fn locate_library(prefix: &Path, name: &str, platform: &Platform) -> Option<PathBuf> {
  let base = library_base(name);

  for dir in platform.library_dirs() {
    let dir = prefix.join(dir);
    let entries = list_names(&dir);

    let (exact, versioned): (Vec<String>, Box<dyn Fn(&str) -> Option<Vec<u64>>>) = match platform.os() {
      Some(Os::MacOs) => {
        let stem = format!("lib{}.", base);
        (
          vec![format!("lib{}.dylib", base)],
          Box::new(move |n: &str| n.strip_prefix(&stem)?.strip_suffix(".dylib").and_then(parse_version)),
        )
      }
      Some(Os::Windows) => {
        let stem = format!("lib{}-", base);
        (
          vec![format!("{}.dll", base), format!("lib{}.dll", base)],
          Box::new(move |n: &str| n.strip_prefix(&stem)?.strip_suffix(".dll").and_then(parse_version)),
        )
      }
      _ => {
        let stem = format!("lib{}.so.", base);
        (
          vec![format!("lib{}.so", base)],
          Box::new(move |n: &str| n.strip_prefix(&stem).and_then(parse_version)),
        )
      }
    };

    if let Some(found) = exact
      .iter()
      .find_map(|file| regular_file_inside(prefix, &dir.join(file)))
    {
      return Some(found);
    }

    // Shortest version wins: libz.so.1 before libz.so.1.3.1.
    let mut candidates: Vec<(Vec<u64>, &String)> = entries
      .iter()
      .filter_map(|n| versioned(n).map(|v| (v, n)))
      .collect();
    candidates.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    if let Some(found) = candidates
      .into_iter()
      .find_map(|(_, n)| regular_file_inside(prefix, &dir.join(n)))
    {
      return Some(found);
    }
  }

  None
}

fn locate_framework(prefix: &Path, name: &str, platform: &Platform) -> Option<PathBuf> {
  if !platform.is_apple() {
    return None;
  }
  let bundle = format!("{}.framework", name);
  ["Frameworks", "lib"].iter().find_map(|root| {
    let bundle = prefix.join(root).join(&bundle);
    regular_file_inside(prefix, &bundle.join(name))
      .or_else(|| regular_file_inside(prefix, &bundle.join("Versions").join("Current").join(name)))
  })
}

fn list_names(dir: &Path) -> Vec<String> {
  let Ok(entries) = fs::read_dir(dir) else {
    return Vec::new();
  };
  let mut names: Vec<String> = entries
    .filter_map(|e| e.ok())
    .filter_map(|e| e.file_name().into_string().ok())
    .collect();
  names.sort();
  names
}

fn parse_version(s: &str) -> Option<Vec<u64>> {
  if s.is_empty() {
    return None;
  }
  s.split('.').map(|part| part.parse().ok()).collect()
}
