//! Implementation of the `cbake build` command.
//!
//! Loads a recipe plus the catalog, toolchain registry and audit policy,
//! builds every platform and prints one line per platform.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use crossbake_lib::audit::AuditPolicy;
use crossbake_lib::deps::DirectoryCatalog;
use crossbake_lib::runner::{Isolation, ToolchainRegistry};
use crossbake_lib::{BuildContext, BuildOptions, BuildRecipe, BuildReport, Platform, autobuild};

use crate::output::{
  OutputFormat, format_bytes, format_duration, print_json, print_note, print_platform_failed, print_platform_ok,
  print_platform_warning, print_script_output, print_stat, short_hash,
};

/// Lines of script output shown for a failed platform.
const OUTPUT_TAIL: usize = 20;

pub struct BuildArgs {
  pub recipe: PathBuf,
  pub catalog: PathBuf,
  pub toolchains: Option<PathBuf>,
  pub policy: Option<PathBuf>,
  pub out_dir: PathBuf,
  pub work_dir: Option<PathBuf>,
  pub keep_workspace: bool,
  pub jobs: Option<usize>,
  pub timeout: Option<Duration>,
  pub unconfined: bool,
  pub output: OutputFormat,
  pub verbose: bool,
}

pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let recipe = BuildRecipe::from_toml_file(&args.recipe)?;

  let toolchains = match &args.toolchains {
    Some(path) => ToolchainRegistry::from_json_file(path)?,
    None => ToolchainRegistry::default(),
  };
  let policy = match &args.policy {
    Some(path) => AuditPolicy::from_json_file(path)?,
    None => AuditPolicy::default(),
  };
  let host = Platform::host().context("Unsupported build host")?;

  let mut options = BuildOptions {
    out_dir: args.out_dir.clone(),
    keep_workspace: args.keep_workspace,
    timeout: args.timeout,
    ..BuildOptions::default()
  };
  if let Some(dir) = &args.work_dir {
    options.work_dir = dir.clone();
  }
  if let Some(jobs) = args.jobs {
    options.parallelism = jobs;
  }
  if args.unconfined {
    options.runner.isolation = Isolation::Unconfined;
  }

  let (cancel_tx, cancel_rx) = watch::channel(false);
  options.cancel = Some(cancel_rx);

  let ctx = BuildContext::new(
    Arc::new(DirectoryCatalog::new(&args.catalog)),
    Arc::new(toolchains),
    Arc::new(policy),
    host,
    options,
  );

  if !args.output.is_json() {
    print_note(&format!(
      "Building {} v{} for {} platform(s)",
      recipe.name,
      recipe.version,
      recipe.platforms.len()
    ));
  }

  let started = Instant::now();
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted; cancelling running builds");
        let _ = cancel_tx.send(true);
      }
    });
    autobuild(&recipe, &ctx).await
  })?;
  let elapsed = started.elapsed();
  info!(elapsed = ?elapsed, "build finished");

  if args.output.is_json() {
    print_json(&report_json(&report))?;
  } else {
    print_report(&report, elapsed, args.verbose);
  }

  if !report.is_success() {
    bail!("{} platform(s) failed", report.failures.len());
  }
  Ok(())
}

fn print_report(report: &BuildReport, elapsed: Duration, verbose: bool) {
  println!();
  for (platform, artifact) in &report.artifacts {
    print_platform_ok(&platform.to_string(), &artifact.archive_path.display().to_string());
    print_stat("sha256", short_hash(&artifact.sha256.0));
    print_stat("size", &format_bytes(artifact.size));
  }

  for (platform, warnings) in &report.warnings {
    for warning in warnings {
      print_platform_warning(&platform.to_string(), warning);
    }
  }

  for (platform, failure) in &report.failures {
    print_platform_failed(&platform.to_string(), failure.kind(), &failure.to_string());
    if let Some(output) = failure.output() {
      print_script_output(output, if verbose { usize::MAX } else { OUTPUT_TAIL });
    }
  }

  for (platform, path) in &report.retained_workspaces {
    print_note(&format!("{} workspace kept at {}", platform, path.display()));
  }

  println!();
  print_stat("Succeeded", &report.artifacts.len().to_string());
  print_stat("Failed", &report.failures.len().to_string());
  print_stat("Elapsed", &format_duration(elapsed));
}

fn report_json(report: &BuildReport) -> serde_json::Value {
  let artifacts: Vec<_> = report.artifacts.values().collect();
  let failures: Vec<_> = report
    .failures
    .iter()
    .map(|(platform, failure)| {
      serde_json::json!({
        "platform": platform.to_string(),
        "kind": failure.kind(),
        "message": failure.to_string(),
        "output": failure.output(),
      })
    })
    .collect();
  let warnings: serde_json::Map<String, serde_json::Value> = report
    .warnings
    .iter()
    .map(|(platform, warnings)| (platform.to_string(), serde_json::json!(warnings)))
    .collect();

  serde_json::json!({
    "artifacts": artifacts,
    "failures": failures,
    "warnings": warnings,
    "retained_workspaces": report
      .retained_workspaces
      .iter()
      .map(|(platform, path)| (platform.to_string(), serde_json::json!(path.display().to_string())))
      .collect::<serde_json::Map<_, _>>(),
  })
}
