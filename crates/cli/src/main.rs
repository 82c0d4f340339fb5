mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::BuildArgs;
use output::OutputFormat;

/// cbake - cross-compile a recipe for many platforms
#[derive(Parser)]
#[command(name = "cbake")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build a recipe for every platform it names
  Build {
    /// Path to the recipe file
    #[arg(default_value = "recipe.toml")]
    recipe: PathBuf,

    /// Dependency catalog directory
    #[arg(long, default_value = "catalog")]
    catalog: PathBuf,

    /// Toolchain registry (JSON)
    #[arg(long)]
    toolchains: Option<PathBuf>,

    /// Audit policy (JSON); built-in defaults when omitted
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Where archives are written
    #[arg(short, long, default_value = "products")]
    out_dir: PathBuf,

    /// Where build workspaces are created
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep build workspaces for inspection
    #[arg(long)]
    keep_workspace: bool,

    /// Platforms built at once
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Build script timeout, e.g. "90m"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Run scripts without bubblewrap
    #[arg(long)]
    unconfined: bool,

    #[arg(long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// List supported platforms
  Platforms {
    #[arg(long, value_enum, default_value_t)]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "info" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build {
      recipe,
      catalog,
      toolchains,
      policy,
      out_dir,
      work_dir,
      keep_workspace,
      jobs,
      timeout,
      unconfined,
      output,
    } => cmd::cmd_build(BuildArgs {
      recipe,
      catalog,
      toolchains,
      policy,
      out_dir,
      work_dir,
      keep_workspace,
      jobs,
      timeout,
      unconfined,
      output,
      verbose: cli.verbose,
    }),
    Commands::Platforms { output } => cmd::cmd_platforms(output),
  }
}
