//! Sandboxed execution of build scripts.
//!
//! A run walks a small state machine:
//!
//! ```text
//! Prepared ──▶ Running ──┬──▶ Succeeded
//!                        ├──▶ Failed
//!                        └──▶ TimedOut
//! ```
//!
//! Each attempt executes exactly once. The script runs under `/bin/sh -e`
//! with a cleared environment (see [`env::build_environment`]) either inside
//! bubblewrap, which binds only the attempt workspace read-write and the
//! toolchain read-only, or unconfined for hosts without user namespaces.
//! Timeouts and cancellation kill the script's whole process group, and
//! jobs the script leaves running in the background are killed once it exits.

pub mod env;
pub mod toolchain;

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

pub use env::{EnvInputs, PathMap, build_environment, write_tool_wrappers};
pub use toolchain::{TOOL_ALIASES, ToolchainImage, ToolchainRegistry};

use crate::consts::{SANDBOX_HOST_TOOLCHAIN, SANDBOX_TOOLCHAIN, SANDBOX_WORKSPACE};
use crate::platform::Platform;
use crate::workspace::BuildWorkspace;

#[derive(Debug, Error)]
pub enum RunError {
  #[error("no toolchain registered for {0}")]
  NoToolchain(Platform),

  #[error("invalid run state transition {from} -> {to}")]
  InvalidTransition { from: RunState, to: RunState },

  #[error("failed to spawn '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to load toolchain registry '{path}': {message}")]
  Registry { path: PathBuf, message: String },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
  Prepared,
  Running,
  Succeeded,
  Failed,
  TimedOut,
}

impl RunState {
  /// Move to `next`, rejecting transitions the state machine does not allow.
  pub fn transition(self, next: RunState) -> Result<RunState, RunError> {
    use RunState::*;
    match (self, next) {
      (Prepared, Running) | (Running, Succeeded) | (Running, Failed) | (Running, TimedOut) => Ok(next),
      (from, to) => Err(RunError::InvalidTransition { from, to }),
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, RunState::Succeeded | RunState::Failed | RunState::TimedOut)
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      RunState::Prepared => "prepared",
      RunState::Running => "running",
      RunState::Succeeded => "succeeded",
      RunState::Failed => "failed",
      RunState::TimedOut => "timed-out",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
  /// bubblewrap with only the workspace writable.
  #[default]
  Bubblewrap,
  /// Cleared environment but no namespaces.
  Unconfined,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
  pub isolation: Isolation,
  pub bwrap: PathBuf,
  pub shell: PathBuf,
  pub nproc: usize,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    RunnerConfig {
      isolation: Isolation::default(),
      bwrap: PathBuf::from("bwrap"),
      shell: PathBuf::from("/bin/sh"),
      nproc: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    }
  }
}

/// One build script execution.
pub struct RunRequest<'a> {
  pub script: &'a str,
  /// Platform the script builds for. Scripts for `any` run with the host's
  /// toolchain.
  pub platform: &'a Platform,
  pub host: &'a Platform,
  pub workspace: &'a BuildWorkspace,
  pub dependency_exports: &'a [(String, PathBuf)],
  pub preferred_compiler: Option<&'a str>,
  pub timeout: Option<Duration>,
  /// Flips to `true` to cancel the run.
  pub cancel: Option<watch::Receiver<bool>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
  pub state: RunState,
  pub exit_code: Option<i32>,
  /// Interleaved stdout and stderr.
  pub output: String,
  pub duration: Duration,
  pub cancelled: bool,
}

impl RunOutcome {
  pub fn succeeded(&self) -> bool {
    self.state == RunState::Succeeded
  }
}

/// Executes build scripts. Implemented by [`LocalRunner`]; tests inject fakes.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
  async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunError>;
}

/// Runs scripts on this machine.
pub struct LocalRunner {
  config: RunnerConfig,
  toolchains: Arc<ToolchainRegistry>,
}

impl LocalRunner {
  pub fn new(config: RunnerConfig, toolchains: Arc<ToolchainRegistry>) -> Self {
    LocalRunner { config, toolchains }
  }

  fn path_map(
    &self,
    workspace: &BuildWorkspace,
    toolchain: &ToolchainImage,
    host_toolchain: Option<&ToolchainImage>,
  ) -> PathMap {
    match self.config.isolation {
      Isolation::Unconfined => PathMap::identity(),
      Isolation::Bubblewrap => {
        let mut paths = PathMap::identity()
          .with_mount(workspace.root(), SANDBOX_WORKSPACE)
          .with_mount(&toolchain.root, SANDBOX_TOOLCHAIN);
        if let Some(host) = separate_host_toolchain(toolchain, host_toolchain) {
          paths = paths.with_mount(&host.root, SANDBOX_HOST_TOOLCHAIN);
        }
        paths
      }
    }
  }

  fn command(
    &self,
    request: &RunRequest<'_>,
    toolchain: &ToolchainImage,
    host_toolchain: Option<&ToolchainImage>,
    paths: &PathMap,
  ) -> Command {
    let ws = request.workspace;
    let script = paths.map(&ws.scratch().join("build.sh"));

    let mut command = match self.config.isolation {
      Isolation::Unconfined => {
        let mut command = Command::new(&self.config.shell);
        command.current_dir(ws.srcdir());
        command
      }
      Isolation::Bubblewrap => {
        let mut command = Command::new(&self.config.bwrap);
        command
          .args(["--unshare-all", "--die-with-parent"])
          .args(["--ro-bind", "/usr", "/usr"])
          .args(["--ro-bind-try", "/bin", "/bin"])
          .args(["--ro-bind-try", "/lib", "/lib"])
          .args(["--ro-bind-try", "/lib64", "/lib64"])
          .args(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"])
          .arg("--ro-bind")
          .arg(&toolchain.root)
          .arg(SANDBOX_TOOLCHAIN);
        if let Some(host) = separate_host_toolchain(toolchain, host_toolchain) {
          command.arg("--ro-bind").arg(&host.root).arg(SANDBOX_HOST_TOOLCHAIN);
        }
        command
          .arg("--bind")
          .arg(ws.root())
          .arg(SANDBOX_WORKSPACE)
          .arg("--chdir")
          .arg(paths.map(&ws.srcdir()))
          .arg(&self.config.shell);
        command
      }
    };

    command
      .arg("-e")
      .arg(script)
      .env_clear()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    command
  }
}

#[async_trait]
impl SandboxRunner for LocalRunner {
  async fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunError> {
    let mut state = RunState::Prepared;
    let ws = request.workspace;
    let effective = if request.platform.is_any() {
      request.host
    } else {
      request.platform
    };

    let toolchain = self
      .toolchains
      .select(effective, request.preferred_compiler)
      .ok_or_else(|| RunError::NoToolchain(effective.clone()))?;
    let host_toolchain = self.toolchains.select(request.host, None);
    let paths = self.path_map(ws, toolchain, host_toolchain);

    write_tool_wrappers(ws, toolchain, host_toolchain, &paths)?;
    tokio::fs::write(ws.scratch().join("build.sh"), request.script).await?;

    let env = build_environment(&EnvInputs {
      workspace: ws,
      platform: effective,
      host: request.host,
      nproc: self.config.nproc,
      toolchain,
      host_toolchain,
      dependency_exports: request.dependency_exports,
      paths: &paths,
    });

    let mut command = self.command(request, toolchain, host_toolchain, &paths);
    command.envs(&env);

    info!(platform = %request.platform, isolation = ?self.config.isolation, toolchain = ?toolchain.root, "running build script");
    let started = Instant::now();
    let program = command.as_std().get_program().to_string_lossy().to_string();
    let mut child = command.spawn().map_err(|source| RunError::Spawn { program, source })?;
    // The id is gone once the child is reaped; the group outlives it.
    let pgid = child.id();
    state = state.transition(RunState::Running)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut output = String::new();
    let exited = Notify::new();
    let (completion, ()) = tokio::join!(
      async {
        let completion = wait_for(&mut child, pgid, request.timeout, request.cancel.clone()).await;
        kill_group(pgid);
        exited.notify_one();
        completion
      },
      drain_output(stdout, stderr, &mut output, &exited),
    );
    let completion = completion?;
    let duration = started.elapsed();

    let (next, exit_code, cancelled) = match completion {
      Completion::Exited(status) if status.success() => (RunState::Succeeded, status.code(), false),
      Completion::Exited(status) => (RunState::Failed, status.code(), false),
      Completion::TimedOut => (RunState::TimedOut, None, false),
      Completion::Cancelled => (RunState::Failed, None, true),
    };
    state = state.transition(next)?;

    match state {
      RunState::Succeeded => info!(platform = %request.platform, ?duration, "build script succeeded"),
      _ => warn!(platform = %request.platform, state = %state, exit_code = ?exit_code, cancelled, "build script did not succeed"),
    }

    Ok(RunOutcome {
      state,
      exit_code,
      output,
      duration,
      cancelled,
    })
  }
}

enum Completion {
  Exited(std::process::ExitStatus),
  TimedOut,
  Cancelled,
}

async fn wait_for(
  child: &mut Child,
  pgid: Option<u32>,
  timeout: Option<Duration>,
  cancel: Option<watch::Receiver<bool>>,
) -> Result<Completion, RunError> {
  let deadline = async {
    match timeout {
      Some(limit) => tokio::time::sleep(limit).await,
      None => std::future::pending().await,
    }
  };

  let cancelled = async {
    match cancel {
      Some(mut rx) => {
        while !*rx.borrow_and_update() {
          if rx.changed().await.is_err() {
            // Sender gone without cancelling.
            std::future::pending::<()>().await;
          }
        }
      }
      None => std::future::pending().await,
    }
  };

  let completion = tokio::select! {
    status = child.wait() => return Ok(Completion::Exited(status?)),
    _ = deadline => Completion::TimedOut,
    _ = cancelled => Completion::Cancelled,
  };

  if !kill_group(pgid)
    && let Err(e) = child.start_kill()
  {
    warn!(error = %e, "failed to kill build script");
  }
  child.wait().await?;
  Ok(completion)
}

/// SIGKILL everything left in the script's process group.
///
/// Returns false when the group no longer exists or cannot be signalled.
fn kill_group(pgid: Option<u32>) -> bool {
  #[cfg(unix)]
  if let Some(pid) = pgid.and_then(|id| rustix::process::Pid::from_raw(id as i32)) {
    return match rustix::process::kill_process_group(pid, rustix::process::Signal::KILL) {
      Ok(()) => {
        debug!(pgid = pid.as_raw_nonzero().get(), "killed process group");
        true
      }
      Err(rustix::io::Errno::SRCH) => false,
      Err(e) => {
        warn!(error = %e, "failed to kill process group");
        false
      }
    };
  }
  #[cfg(not(unix))]
  let _ = pgid;
  false
}

/// How long output is still read after the script and its group are gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Collect script output until the pipes close, or until [`DRAIN_GRACE`]
/// after `exited` fires if something outside the group still holds them.
async fn drain_output<O, E>(stdout: Option<O>, stderr: Option<E>, output: &mut String, exited: &Notify)
where
  O: AsyncRead + Unpin,
  E: AsyncRead + Unpin,
{
  let grace = async {
    exited.notified().await;
    tokio::time::sleep(DRAIN_GRACE).await;
  };
  tokio::select! {
    () = collect_output(stdout, stderr, output) => {}
    () = grace => warn!("script output still open after exit, truncating"),
  }
}

/// Read stdout and stderr concurrently into one buffer, in arrival order.
async fn collect_output<O, E>(stdout: Option<O>, stderr: Option<E>, output: &mut String)
where
  O: AsyncRead + Unpin,
  E: AsyncRead + Unpin,
{
  let mut out = stdout.map(|s| BufReader::new(s).split(b'\n'));
  let mut err = stderr.map(|s| BufReader::new(s).split(b'\n'));

  loop {
    let line = tokio::select! {
      line = next_segment(&mut out), if out.is_some() => {
        if line.is_none() {
          out = None;
        }
        line
      }
      line = next_segment(&mut err), if err.is_some() => {
        if line.is_none() {
          err = None;
        }
        line
      }
      else => break,
    };
    if let Some(line) = line {
      let text = String::from_utf8_lossy(&line);
      debug!(target: "crossbake::script", "{}", text);
      output.push_str(&text);
      output.push('\n');
    }
  }
}

/// The host toolchain when it is not the target toolchain itself.
fn separate_host_toolchain<'a>(
  toolchain: &ToolchainImage,
  host_toolchain: Option<&'a ToolchainImage>,
) -> Option<&'a ToolchainImage> {
  host_toolchain.filter(|host| host.root != toolchain.root)
}

async fn next_segment<R: AsyncRead + Unpin>(reader: &mut Option<tokio::io::Split<BufReader<R>>>) -> Option<Vec<u8>> {
  match reader {
    Some(split) => split.next_segment().await.ok().flatten(),
    None => None,
  }
}
