use thiserror::Error;

use super::BuildRecipe;
use crate::platform::Platform;
use crate::products::ProductError;
use crate::sources::StageError;

/// Problems with a recipe, found before any workspace exists.
#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("package name is empty")]
  EmptyName,

  #[error("package name '{0}' may only contain letters, digits, '_', '-' and '.'")]
  InvalidName(String),

  #[error("build script is empty")]
  EmptyScript,

  #[error("no platforms requested")]
  NoPlatforms,

  /// Not `MAJOR.MINOR.PATCH`.
  #[error("invalid version '{version}': {reason}")]
  InvalidVersion { version: String, reason: String },

  /// Pre-release or build metadata present.
  #[error("version '{0}' must not carry pre-release or build metadata")]
  DisqualifiedVersion(String),

  #[error("'any' cannot be combined with concrete platforms")]
  MixedAnyPlatform,

  #[error("platform {0} requested more than once")]
  DuplicatePlatform(Platform),

  #[error(transparent)]
  Product(#[from] ProductError),

  #[error(transparent)]
  Source(#[from] StageError),
}

/// Check everything about `recipe` that does not need the network or a
/// workspace.
pub fn validate(recipe: &BuildRecipe) -> Result<(), ValidationError> {
  if recipe.name.is_empty() {
    return Err(ValidationError::EmptyName);
  }
  if !recipe
    .name
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    || recipe.name.starts_with('.')
  {
    return Err(ValidationError::InvalidName(recipe.name.clone()));
  }
  if recipe.script.trim().is_empty() {
    return Err(ValidationError::EmptyScript);
  }

  let version = semver::Version::parse(&recipe.version).map_err(|e| ValidationError::InvalidVersion {
    version: recipe.version.clone(),
    reason: e.to_string(),
  })?;
  if !version.pre.is_empty() || !version.build.is_empty() {
    return Err(ValidationError::DisqualifiedVersion(recipe.version.clone()));
  }

  if recipe.platforms.is_empty() {
    return Err(ValidationError::NoPlatforms);
  }
  let has_any = recipe.platforms.iter().any(Platform::is_any);
  if has_any && recipe.platforms.len() > 1 {
    return Err(ValidationError::MixedAnyPlatform);
  }
  for (i, platform) in recipe.platforms.iter().enumerate() {
    if recipe.platforms[..i].contains(platform) {
      return Err(ValidationError::DuplicatePlatform(platform.clone()));
    }
  }

  if has_any && let Some(product) = recipe.products.iter().find(|p| p.is_platform_specific()) {
    return Err(ProductError::IllegalForAny(product.to_string()).into());
  }

  for source in &recipe.sources {
    source.validate()?;
  }

  Ok(())
}
