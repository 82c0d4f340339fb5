//! Dependency resolution and staging.
//!
//! Each [`DependencyRequest`] is resolved against a [`DependencyCatalog`]
//! for its effective platform (the build target for target-scope requests,
//! the native platform for host-scope ones) and installed into the matching
//! root of the attempt workspace. Every request is attempted before failures
//! are reported, so a recipe with several bad dependencies learns about all of
//! them at once.

mod catalog;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use catalog::{CatalogArtifact, DependencyCatalog, DirectoryCatalog, LookupError};

use crate::package::install;
use crate::platform::Platform;
use crate::products::{LocatedProduct, locate_all};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyScope {
  /// Linked into the target binaries.
  #[default]
  Target,
  /// Executed on the build host during the build.
  Host,
}

impl fmt::Display for DependencyScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DependencyScope::Target => write!(f, "target"),
      DependencyScope::Host => write!(f, "host"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequest {
  pub package: String,
  #[serde(default)]
  pub scope: DependencyScope,
  /// Pin the artifact platform instead of deriving it from the scope.
  #[serde(default)]
  pub platform: Option<Platform>,
}

impl DependencyRequest {
  pub fn target(package: &str) -> Self {
    DependencyRequest {
      package: package.to_string(),
      scope: DependencyScope::Target,
      platform: None,
    }
  }

  pub fn host(package: &str) -> Self {
    DependencyRequest {
      package: package.to_string(),
      scope: DependencyScope::Host,
      platform: None,
    }
  }

  pub fn pinned(mut self, platform: Platform) -> Self {
    self.platform = Some(platform);
    self
  }
}

/// A dependency installed into a workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedArtifact {
  pub package: String,
  pub version: String,
  pub scope: DependencyScope,
  pub platform: Platform,
  /// Root the artifact was installed into.
  pub root: PathBuf,
  pub products: Vec<LocatedProduct>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedDependencies {
  pub target: Vec<StagedArtifact>,
  pub host: Vec<StagedArtifact>,
  pub warnings: Vec<String>,
}

impl ResolvedDependencies {
  /// `dep_<symbol>` → absolute product path for every staged product.
  pub fn product_exports(&self) -> Vec<(String, PathBuf)> {
    self
      .target
      .iter()
      .chain(&self.host)
      .flat_map(|artifact| {
        artifact
          .products
          .iter()
          .map(|p| (format!("dep_{}", p.product.symbol()), artifact.root.join(&p.relative)))
      })
      .collect()
  }
}

/// Why a single request could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyFailure {
  #[error("{package}: {source}")]
  Lookup {
    package: String,
    #[source]
    source: LookupError,
  },

  #[error("{package}: staging failed: {message}")]
  Staging { package: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
  #[error("host dependency '{package}' pinned to {requested}, which {host} cannot execute")]
  HostIncompatible {
    package: String,
    requested: Platform,
    host: Platform,
  },

  #[error("unsatisfied dependencies: {}", .failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
  UnsatisfiedDependencies { failures: Vec<DependencyFailure> },
}

/// Inputs the resolver needs beyond the requests themselves.
#[derive(Clone)]
pub struct ResolverContext {
  pub catalog: Arc<dyn DependencyCatalog>,
  /// Native platform of the runner.
  pub host: Platform,
  pub target_root: PathBuf,
  pub host_root: PathBuf,
}

impl ResolverContext {
  fn effective_platform(&self, request: &DependencyRequest, target: &Platform) -> Platform {
    match (&request.platform, request.scope) {
      (Some(pinned), _) => pinned.clone(),
      (None, DependencyScope::Target) => target.clone(),
      (None, DependencyScope::Host) => self.host.clone(),
    }
  }
}

/// Resolve and stage `requests` for a build targeting `target`.
///
/// Blocking: reads the catalog and extracts archives.
pub fn resolve(
  requests: &[DependencyRequest],
  target: &Platform,
  ctx: &ResolverContext,
) -> Result<ResolvedDependencies, DependencyError> {
  // Checked up front so the outcome never depends on catalog contents.
  for request in requests {
    if request.scope == DependencyScope::Host
      && let Some(pinned) = &request.platform
      && !ctx.host.can_execute(pinned)
    {
      return Err(DependencyError::HostIncompatible {
        package: request.package.clone(),
        requested: pinned.clone(),
        host: ctx.host.clone(),
      });
    }
  }

  let mut resolved = ResolvedDependencies::default();
  let mut failures = Vec::new();

  for request in requests {
    let platform = ctx.effective_platform(request, target);
    match stage_one(request, &platform, ctx) {
      Ok(artifact) => {
        info!(package = %artifact.package, version = %artifact.version, scope = %artifact.scope, platform = %artifact.platform, "staged dependency");
        match request.scope {
          DependencyScope::Target => resolved.target.push(artifact),
          DependencyScope::Host => resolved.host.push(artifact),
        }
      }
      Err(failure) => {
        warn!(scope = %request.scope, error = %failure, "dependency unavailable");
        resolved.warnings.push(failure.to_string());
        failures.push(failure);
      }
    }
  }

  if failures.is_empty() {
    Ok(resolved)
  } else {
    Err(DependencyError::UnsatisfiedDependencies { failures })
  }
}

fn stage_one(
  request: &DependencyRequest,
  platform: &Platform,
  ctx: &ResolverContext,
) -> Result<StagedArtifact, DependencyFailure> {
  let artifact = ctx
    .catalog
    .lookup(&request.package, platform)
    .map_err(|source| DependencyFailure::Lookup {
      package: request.package.clone(),
      source,
    })?;

  let root = match request.scope {
    DependencyScope::Target => &ctx.target_root,
    DependencyScope::Host => &ctx.host_root,
  };

  let staging_err = |message: String| DependencyFailure::Staging {
    package: request.package.clone(),
    message,
  };

  debug!(package = %request.package, archive = ?artifact.archive, root = ?root, "installing dependency");
  install(&artifact.archive, &artifact.sha256, root).map_err(|e| staging_err(e.to_string()))?;

  let products = locate_all(&artifact.products, root, &artifact.platform).map_err(|e| staging_err(e.to_string()))?;

  Ok(StagedArtifact {
    package: artifact.package,
    version: artifact.version,
    scope: request.scope,
    platform: artifact.platform,
    root: root.clone(),
    products,
  })
}
