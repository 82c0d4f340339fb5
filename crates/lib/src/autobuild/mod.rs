//! The build orchestrator.
//!
//! [`autobuild`] validates a recipe, then runs the per-platform pipeline
//!
//! ```text
//! workspace → stage sources → resolve dependencies → run script
//!           → locate products → audit → package
//! ```
//!
//! for every requested platform, at most `parallelism` at a time. A failing
//! platform never stops its siblings; the [`BuildReport`] carries artifacts
//! and failures side by side.

mod recipe;
mod types;
mod validate;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use recipe::BuildRecipe;
pub use types::{BuildContext, BuildError, BuildOptions, BuildReport, PlatformFailure};
pub use validate::{ValidationError, validate};

use crate::audit::{self, AuditContext, Severity};
use crate::consts::SANDBOX_WORKSPACE;
use crate::deps::{self, ResolverContext};
use crate::package::{self, PackagedArtifact};
use crate::platform::Platform;
use crate::products::locate_all;
use crate::runner::{RunRequest, RunState};
use crate::sources::stage_all;
use crate::workspace::BuildWorkspace;

/// What one platform attempt produced.
struct PlatformOutcome {
  result: Result<PackagedArtifact, PlatformFailure>,
  warnings: Vec<String>,
  retained: Option<PathBuf>,
}

/// Build `recipe` for every platform it names.
///
/// Returns `Err` only when nothing could be attempted: an invalid recipe or
/// unusable output directories. No workspace exists before validation passes.
pub async fn autobuild(recipe: &BuildRecipe, ctx: &BuildContext) -> Result<BuildReport, BuildError> {
  validate(recipe)?;

  info!(
    package = %recipe.name,
    version = %recipe.version,
    platforms = recipe.platforms.len(),
    parallelism = ctx.options.parallelism,
    "starting build"
  );

  std::fs::create_dir_all(&ctx.options.out_dir)?;
  std::fs::create_dir_all(&ctx.options.work_dir)?;

  let recipe = Arc::new(recipe.clone());
  let semaphore = Arc::new(Semaphore::new(ctx.options.parallelism.max(1)));
  let mut join_set = JoinSet::new();

  for platform in &recipe.platforms {
    let platform = platform.clone();
    let recipe = recipe.clone();
    let ctx = ctx.clone();
    let semaphore = semaphore.clone();

    join_set.spawn(async move {
      let outcome = match semaphore.acquire_owned().await {
        Ok(_permit) => build_platform(&recipe, &platform, &ctx).await,
        Err(e) => PlatformOutcome {
          result: Err(PlatformFailure::Task(e.to_string())),
          warnings: Vec::new(),
          retained: None,
        },
      };
      (platform, outcome)
    });
  }

  let report = collect_outcomes(join_set, &recipe.platforms).await;

  info!(
    package = %recipe.name,
    succeeded = report.artifacts.len(),
    failed = report.failures.len(),
    "build complete"
  );

  Ok(report)
}

/// Fold task results into a report. Platforms whose task panicked are
/// reported as [`PlatformFailure::Task`].
async fn collect_outcomes(mut join_set: JoinSet<(Platform, PlatformOutcome)>, platforms: &[Platform]) -> BuildReport {
  let mut report = BuildReport::default();
  let mut pending: BTreeSet<Platform> = platforms.iter().cloned().collect();

  while let Some(join_result) = join_set.join_next().await {
    match join_result {
      Ok((platform, outcome)) => {
        pending.remove(&platform);
        if !outcome.warnings.is_empty() {
          report.warnings.insert(platform.clone(), outcome.warnings);
        }
        if let Some(path) = outcome.retained {
          report.retained_workspaces.insert(platform.clone(), path);
        }
        match outcome.result {
          Ok(artifact) => {
            info!(platform = %platform, archive = ?artifact.archive_path, "platform succeeded");
            report.artifacts.insert(platform, artifact);
          }
          Err(e) => {
            error!(platform = %platform, kind = e.kind(), error = %e, "platform failed");
            report.failures.insert(platform, e);
          }
        }
      }
      Err(e) => {
        error!(error = %e, "build task panicked");
      }
    }
  }

  for platform in pending {
    report
      .failures
      .insert(platform, PlatformFailure::Task("build task panicked".to_string()));
  }

  report
}

async fn build_platform(recipe: &BuildRecipe, platform: &Platform, ctx: &BuildContext) -> PlatformOutcome {
  let mut workspace = match BuildWorkspace::create(&ctx.options.work_dir, &recipe.name, platform) {
    Ok(ws) => ws,
    Err(e) => {
      return PlatformOutcome {
        result: Err(PlatformFailure::Workspace(e.to_string())),
        warnings: Vec::new(),
        retained: None,
      };
    }
  };

  let mut warnings = Vec::new();
  let result = run_pipeline(recipe, platform, ctx, &workspace, &mut warnings).await;

  let retained = if ctx.options.keep_workspace {
    Some(workspace.retain())
  } else {
    debug!(platform = %platform, root = ?workspace.root(), "discarding workspace");
    None
  };

  PlatformOutcome {
    result,
    warnings,
    retained,
  }
}

async fn run_pipeline(
  recipe: &BuildRecipe,
  platform: &Platform,
  ctx: &BuildContext,
  ws: &BuildWorkspace,
  warnings: &mut Vec<String>,
) -> Result<PackagedArtifact, PlatformFailure> {
  let staged = stage_all(&recipe.sources, ws, &ctx.options.stager).await?;
  debug!(platform = %platform, sources = staged.len(), "sources staged");

  let resolver = ResolverContext {
    catalog: ctx.catalog.clone(),
    host: ctx.host.clone(),
    target_root: ws.target_deps(),
    host_root: ws.host_deps(),
  };
  let requests = recipe.dependencies.clone();
  let target = platform.clone();
  let resolved = tokio::task::spawn_blocking(move || deps::resolve(&requests, &target, &resolver))
    .await
    .map_err(|e| PlatformFailure::Task(e.to_string()))??;
  warnings.extend(resolved.warnings.iter().cloned());

  let exports = resolved.product_exports();
  let request = RunRequest {
    script: &recipe.script,
    platform,
    host: &ctx.host,
    workspace: ws,
    dependency_exports: &exports,
    preferred_compiler: recipe.preferred_compiler.as_deref(),
    timeout: ctx.options.timeout,
    cancel: ctx.options.cancel.clone(),
  };
  let outcome = ctx.runner.run(&request).await?;
  match outcome.state {
    RunState::Succeeded => {}
    RunState::TimedOut => return Err(PlatformFailure::RunTimedOut { output: outcome.output }),
    _ => {
      return Err(PlatformFailure::RunFailed {
        exit_code: outcome.exit_code,
        output: outcome.output,
        cancelled: outcome.cancelled,
      });
    }
  }

  let prefix = ws.prefix();
  let located = locate_all(&recipe.products, &prefix, platform)?;
  debug!(platform = %platform, products = located.len(), "products located");

  let report = {
    let prefix = prefix.clone();
    let platform = platform.clone();
    let package = recipe.name.clone();
    let policy = ctx.policy.clone();
    let install_roots = install_roots(ws);
    let target_deps = ws.target_deps();
    tokio::task::spawn_blocking(move || {
      let dependency_libraries = audit::provided_libraries(&target_deps, &platform);
      audit::audit(
        &prefix,
        &platform,
        &AuditContext {
          package: &package,
          policy: &policy,
          dependency_libraries: &dependency_libraries,
          install_roots: &install_roots,
        },
      )
    })
    .await
    .map_err(|e| PlatformFailure::Task(e.to_string()))?
  };

  if let Some(first) = report.first_fatal() {
    return Err(PlatformFailure::AuditFatal {
      category: first.category,
      findings: report.with_severity(Severity::Fatal).cloned().collect(),
    });
  }
  for finding in report.with_severity(Severity::Warning) {
    warn!(platform = %platform, finding = %finding, "audit warning");
    warnings.push(finding.to_string());
  }

  let out_dir = ctx.options.out_dir.clone();
  let name = recipe.name.clone();
  let version = recipe.version.clone();
  let target = platform.clone();
  let artifact = tokio::task::spawn_blocking(move || package::package(&prefix, &out_dir, &name, &version, &target))
    .await
    .map_err(|e| PlatformFailure::Task(e.to_string()))??;

  Ok(artifact)
}

/// Absolute locations the script may have baked into binaries for the
/// prefix and the target dependency root, both on the host and inside the
/// sandbox.
fn install_roots(ws: &BuildWorkspace) -> Vec<PathBuf> {
  let mut roots = Vec::new();
  for dir in [ws.prefix(), ws.target_deps()] {
    if let Ok(relative) = dir.strip_prefix(ws.root()) {
      roots.push(Path::new(SANDBOX_WORKSPACE).join(relative));
    }
    roots.push(dir);
  }
  roots
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;
  use std::time::Duration;

  use async_trait::async_trait;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  use super::*;
  use crate::audit::{AuditCategory, AuditPolicy};
  use crate::deps::{CatalogArtifact, DependencyCatalog, LookupError};
  use crate::platform::{Arch, Os};
  use crate::products::Product;
  use crate::runner::{RunError, RunOutcome, SandboxRunner};
  use crate::util::testutil::{EM_AARCH64, EM_X86_64, ElfFixture, write_file};

  struct EmptyCatalog;

  impl DependencyCatalog for EmptyCatalog {
    fn lookup(&self, package: &str, _platform: &Platform) -> Result<CatalogArtifact, LookupError> {
      Err(LookupError::UnknownPackage(package.to_string()))
    }
  }

  type Populate = dyn Fn(&Platform, &Path) + Send + Sync;

  /// Writes files into the prefix instead of running the script.
  struct FakeRunner {
    populate: Box<Populate>,
    state: RunState,
    calls: Mutex<Vec<Platform>>,
  }

  impl FakeRunner {
    fn new(populate: impl Fn(&Platform, &Path) + Send + Sync + 'static) -> Self {
      FakeRunner {
        populate: Box::new(populate),
        state: RunState::Succeeded,
        calls: Mutex::new(Vec::new()),
      }
    }

    fn failing(state: RunState) -> Self {
      FakeRunner {
        state,
        ..FakeRunner::new(|_, _| {})
      }
    }
  }

  #[async_trait]
  impl SandboxRunner for FakeRunner {
    async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunError> {
      self.calls.lock().unwrap().push(request.platform.clone());
      (self.populate)(request.platform, &request.workspace.prefix());
      Ok(RunOutcome {
        state: self.state,
        exit_code: match self.state {
          RunState::Succeeded => Some(0),
          RunState::Failed => Some(2),
          _ => None,
        },
        output: "fake output".to_string(),
        duration: Duration::from_millis(1),
        cancelled: false,
      })
    }
  }

  fn linux() -> Platform {
    Platform::new(Arch::X86_64, Os::Linux)
  }

  fn linux_arm() -> Platform {
    Platform::new(Arch::Aarch64, Os::Linux)
  }

  fn recipe(platforms: Vec<Platform>) -> BuildRecipe {
    BuildRecipe {
      name: "hello".to_string(),
      version: "1.0.0".to_string(),
      sources: Vec::new(),
      script: "make install".to_string(),
      platforms,
      products: vec![Product::executable("hello", "hello")],
      dependencies: Vec::new(),
      preferred_compiler: None,
    }
  }

  fn context(dir: &TempDir, runner: Arc<FakeRunner>) -> BuildContext {
    let options = BuildOptions {
      out_dir: dir.path().join("out"),
      work_dir: dir.path().join("work"),
      parallelism: 2,
      ..BuildOptions::default()
    };
    BuildContext::new(
      Arc::new(EmptyCatalog),
      Arc::new(crate::runner::ToolchainRegistry::default()),
      Arc::new(AuditPolicy::default()),
      linux(),
      options,
    )
    .with_runner(runner)
  }

  fn machine(platform: &Platform) -> u16 {
    match platform.arch() {
      Some(Arch::Aarch64) => EM_AARCH64,
      _ => EM_X86_64,
    }
  }

  fn install_hello(platform: &Platform, prefix: &Path) {
    let exe = ElfFixture::executable(machine(platform)).needs("libc.so.6").build();
    write_file(prefix, "bin/hello", &exe);
    write_file(prefix, "share/licenses/hello/LICENSE", b"MIT");
  }

  #[tokio::test]
  async fn builds_every_platform() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new(install_hello));
    let ctx = context(&dir, runner.clone());

    let report = autobuild(&recipe(vec![linux(), linux_arm()]), &ctx).await.unwrap();

    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.artifacts.len(), 2);
    for (platform, artifact) in &report.artifacts {
      assert_eq!(&artifact.platform, platform);
      assert!(artifact.archive_path.starts_with(dir.path().join("out")));
      assert!(artifact.archive_path.exists());
    }
    assert_eq!(runner.calls.lock().unwrap().len(), 2);
    assert!(report.retained_workspaces.is_empty());
    assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn invalid_recipe_creates_nothing() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new(install_hello));
    let ctx = context(&dir, runner.clone());

    let mut r = recipe(vec![Platform::Any]);
    r.products = vec![Product::library("hello", "libhello")];
    let err = autobuild(&r, &ctx).await.unwrap_err();

    assert!(matches!(err, BuildError::Validation(ValidationError::Product(_))));
    assert!(!dir.path().join("work").exists());
    assert!(runner.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn undeclared_linkage_fails_without_package() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new(|platform: &Platform, prefix: &Path| {
      install_hello(platform, prefix);
      if platform.arch() == Some(Arch::Aarch64) {
        let exe = ElfFixture::executable(EM_AARCH64).needs("libssl.so.3").build();
        write_file(prefix, "bin/hello", &exe);
      }
    }));
    let ctx = context(&dir, runner);

    let report = autobuild(&recipe(vec![linux(), linux_arm()]), &ctx).await.unwrap();

    assert!(report.artifacts.contains_key(&linux()));
    let failure = &report.failures[&linux_arm()];
    assert_eq!(failure.kind(), "AuditFatal");
    assert!(matches!(
      failure,
      PlatformFailure::AuditFatal {
        category: AuditCategory::DisallowedLinkage,
        ..
      }
    ));
    let archive = package::archive_name("hello", "1.0.0", &linux_arm());
    assert!(!dir.path().join("out").join(archive).exists());
  }

  #[tokio::test]
  #[traced_test]
  async fn script_failures_are_reported_per_platform() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir, Arc::new(FakeRunner::failing(RunState::Failed)));

    let report = autobuild(&recipe(vec![linux()]), &ctx).await.unwrap();
    let failure = &report.failures[&linux()];
    assert_eq!(failure.kind(), "RunFailed");
    assert_eq!(failure.output(), Some("fake output"));
    assert!(failure.to_string().contains("exit code 2"));
    assert!(logs_contain("platform failed"));

    let ctx = context(&dir, Arc::new(FakeRunner::failing(RunState::TimedOut)));
    let report = autobuild(&recipe(vec![linux()]), &ctx).await.unwrap();
    assert_eq!(report.failures[&linux()].kind(), "RunTimedOut");
  }

  #[tokio::test]
  async fn missing_products_are_all_listed() {
    let dir = TempDir::new().unwrap();
    let ctx = context(
      &dir,
      Arc::new(FakeRunner::new(|_: &Platform, prefix: &Path| {
        write_file(prefix, "share/licenses/hello/LICENSE", b"MIT");
      })),
    );

    let mut r = recipe(vec![linux()]);
    r.products.push(Product::library("hello", "libhello"));
    let report = autobuild(&r, &ctx).await.unwrap();

    let failure = &report.failures[&linux()];
    assert_eq!(failure.kind(), "MissingProducts");
    let message = failure.to_string();
    assert!(message.contains("executable 'hello'"));
    assert!(message.contains("library 'hello'"));
  }

  #[tokio::test]
  async fn unavailable_dependencies_fail_before_running() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(FakeRunner::new(install_hello));
    let ctx = context(&dir, runner.clone());

    let mut r = recipe(vec![linux()]);
    r.dependencies = vec![deps::DependencyRequest::target("nonexistent")];
    let report = autobuild(&r, &ctx).await.unwrap();

    assert_eq!(report.failures[&linux()].kind(), "UnsatisfiedDependencies");
    assert!(runner.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn missing_license_is_a_warning() {
    let dir = TempDir::new().unwrap();
    let ctx = context(
      &dir,
      Arc::new(FakeRunner::new(|platform: &Platform, prefix: &Path| {
        let exe = ElfFixture::executable(machine(platform)).build();
        write_file(prefix, "bin/hello", &exe);
      })),
    );

    let report = autobuild(&recipe(vec![linux()]), &ctx).await.unwrap();

    assert!(report.is_success());
    assert!(report.warnings[&linux()][0].contains("missing-license"));
  }

  #[tokio::test]
  async fn keep_workspace_retains_it() {
    let dir = TempDir::new().unwrap();
    let mut ctx = context(&dir, Arc::new(FakeRunner::new(install_hello)));
    ctx.options.keep_workspace = true;

    let report = autobuild(&recipe(vec![linux()]), &ctx).await.unwrap();

    let retained = &report.retained_workspaces[&linux()];
    assert!(retained.join("destdir/bin/hello").exists());
  }

  #[test]
  fn install_roots_cover_host_and_sandbox_paths() {
    let dir = TempDir::new().unwrap();
    let ws = BuildWorkspace::create(dir.path(), "hello", &linux()).unwrap();
    let roots = install_roots(&ws);

    assert!(roots.contains(&ws.prefix()));
    assert!(roots.contains(&ws.target_deps()));
    assert!(roots.contains(&PathBuf::from("/workspace/destdir")));
  }
}
