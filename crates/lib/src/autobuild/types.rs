use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use super::validate::ValidationError;
use crate::audit::{AuditCategory, AuditFinding, AuditPolicy};
use crate::deps::{DependencyCatalog, DependencyError};
use crate::package::{PackageError, PackagedArtifact};
use crate::platform::Platform;
use crate::products::ProductError;
use crate::runner::{LocalRunner, RunError, RunnerConfig, SandboxRunner, ToolchainRegistry};
use crate::sources::{StageError, StagerConfig};

/// Errors that stop a build before any platform is attempted.
#[derive(Debug, Error)]
pub enum BuildError {
  /// The recipe failed validation.
  #[error("invalid recipe: {0}")]
  Validation(#[from] ValidationError),

  /// The recipe could not be read or parsed.
  #[error("failed to load recipe{}: {message}", .path.as_ref().map(|p| format!(" '{}'", p.display())).unwrap_or_default())]
  Recipe { path: Option<PathBuf>, message: String },

  /// Output or work directories could not be created.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Why one platform produced no artifact.
#[derive(Debug, Error)]
pub enum PlatformFailure {
  #[error("failed to create workspace: {0}")]
  Workspace(String),

  #[error(transparent)]
  Stage(#[from] StageError),

  #[error(transparent)]
  Dependencies(#[from] DependencyError),

  /// The build script exited unsuccessfully or was cancelled.
  #[error("build script failed{}", match (.cancelled, .exit_code) {
    (true, _) => " (cancelled)".to_string(),
    (false, Some(code)) => format!(" with exit code {}", code),
    (false, None) => " (killed by signal)".to_string(),
  })]
  RunFailed {
    exit_code: Option<i32>,
    output: String,
    cancelled: bool,
  },

  #[error("build script timed out")]
  RunTimedOut { output: String },

  /// The runner itself could not execute the script.
  #[error(transparent)]
  Runner(#[from] RunError),

  #[error(transparent)]
  MissingProducts(#[from] ProductError),

  /// At least one fatal audit finding; `category` is the first one's.
  #[error("audit failed ({category}): {}", .findings.first().map(ToString::to_string).unwrap_or_default())]
  AuditFatal {
    category: AuditCategory,
    findings: Vec<AuditFinding>,
  },

  #[error(transparent)]
  Package(#[from] PackageError),

  /// A pipeline task died.
  #[error("build task failed: {0}")]
  Task(String),
}

impl PlatformFailure {
  /// Stable name of the failure class.
  pub fn kind(&self) -> &'static str {
    match self {
      PlatformFailure::Workspace(_) => "Workspace",
      PlatformFailure::Stage(e) => match e {
        StageError::IntegrityMismatch { .. } => "IntegrityMismatch",
        StageError::RevisionNotFound { .. } => "RevisionNotFound",
        StageError::FetchFailed { .. } => "FetchFailed",
        _ => "StageFailed",
      },
      PlatformFailure::Dependencies(e) => match e {
        DependencyError::HostIncompatible { .. } => "HostIncompatible",
        DependencyError::UnsatisfiedDependencies { .. } => "UnsatisfiedDependencies",
      },
      PlatformFailure::RunFailed { .. } => "RunFailed",
      PlatformFailure::RunTimedOut { .. } => "RunTimedOut",
      PlatformFailure::Runner(_) => "RunnerError",
      PlatformFailure::MissingProducts(e) => match e {
        ProductError::MissingProducts { .. } => "MissingProducts",
        ProductError::IllegalForAny(_) => "IllegalForAny",
      },
      PlatformFailure::AuditFatal { .. } => "AuditFatal",
      PlatformFailure::Package(e) => match e {
        PackageError::HashMismatch { .. } => "HashMismatch",
        _ => "PackageFailed",
      },
      PlatformFailure::Task(_) => "TaskFailed",
    }
  }

  /// Captured script output, for failures that have one.
  pub fn output(&self) -> Option<&str> {
    match self {
      PlatformFailure::RunFailed { output, .. } | PlatformFailure::RunTimedOut { output } => Some(output),
      _ => None,
    }
  }
}

/// Result of [`autobuild`](super::autobuild): artifacts and failures side by side.
#[derive(Debug, Default)]
pub struct BuildReport {
  pub artifacts: BTreeMap<Platform, PackagedArtifact>,
  pub failures: BTreeMap<Platform, PlatformFailure>,
  /// Non-fatal audit findings and dependency warnings.
  pub warnings: BTreeMap<Platform, Vec<String>>,
  /// Workspaces left on disk because of `keep_workspace`.
  pub retained_workspaces: BTreeMap<Platform, PathBuf>,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.failures.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Where packaged archives are written.
  pub out_dir: PathBuf,
  /// Where per-attempt workspaces are created.
  pub work_dir: PathBuf,
  pub keep_workspace: bool,
  /// Maximum platforms built at once.
  pub parallelism: usize,
  /// Applies to the build script only.
  pub timeout: Option<Duration>,
  pub stager: StagerConfig,
  pub runner: RunnerConfig,
  /// Flips to `true` to cancel running scripts.
  pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for BuildOptions {
  fn default() -> Self {
    BuildOptions {
      out_dir: PathBuf::from("products"),
      work_dir: std::env::temp_dir().join("crossbake"),
      keep_workspace: false,
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      timeout: None,
      stager: StagerConfig::default(),
      runner: RunnerConfig::default(),
      cancel: None,
    }
  }
}

/// Shared, read-only inputs of a build.
#[derive(Clone)]
pub struct BuildContext {
  pub catalog: Arc<dyn DependencyCatalog>,
  pub runner: Arc<dyn SandboxRunner>,
  pub policy: Arc<AuditPolicy>,
  /// Native platform of the build machine.
  pub host: Platform,
  pub options: BuildOptions,
}

impl BuildContext {
  /// Context running scripts on this machine with `options.runner`.
  pub fn new(
    catalog: Arc<dyn DependencyCatalog>,
    toolchains: Arc<ToolchainRegistry>,
    policy: Arc<AuditPolicy>,
    host: Platform,
    options: BuildOptions,
  ) -> Self {
    let runner = Arc::new(LocalRunner::new(options.runner.clone(), toolchains));
    BuildContext {
      catalog,
      runner,
      policy,
      host,
      options,
    }
  }

  pub fn with_runner(mut self, runner: Arc<dyn SandboxRunner>) -> Self {
    self.runner = runner;
    self
  }
}
