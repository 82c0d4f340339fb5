//! End-to-end builds through the local runner.

use crossbake_lib::package;
use crossbake_lib::platform::Platform;
use crossbake_lib::products::Product;
use crossbake_lib::{BuildError, PlatformFailure, ValidationError, autobuild};
use tempfile::TempDir;

use super::common::{HELLO_SCRIPT, TestEnv, linux, recipe};

#[tokio::test]
async fn echo_hello_builds_packages_and_installs() {
  let env = TestEnv::new();
  let report = autobuild(&recipe(HELLO_SCRIPT), &env.context()).await.unwrap();

  assert!(report.is_success(), "{:?}", report.failures);
  assert!(report.warnings.get(&linux()).is_none_or(|w| w.is_empty()));
  let artifact = &report.artifacts[&linux()];
  assert_eq!(
    artifact.archive_path,
    env.out_dir().join("hello.v1.0.0.x86_64-linux-gnu.tar.gz")
  );
  assert_eq!(artifact.sha256.0.len(), 64);

  let dest = TempDir::new().unwrap();
  package::install(&artifact.archive_path, &artifact.sha256.0, dest.path()).unwrap();
  let hello = dest.path().join("bin/hello");
  assert_eq!(std::fs::read_to_string(&hello).unwrap(), "#!/bin/sh\necho hello\n");

  let output = std::process::Command::new(&hello).output().unwrap();
  assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
}

#[tokio::test]
async fn repeated_builds_are_byte_identical() {
  let first = TestEnv::new();
  let second = TestEnv::new();

  let a = autobuild(&recipe(HELLO_SCRIPT), &first.context()).await.unwrap();
  let b = autobuild(&recipe(HELLO_SCRIPT), &second.context()).await.unwrap();

  let (a, b) = (&a.artifacts[&linux()], &b.artifacts[&linux()]);
  assert_eq!(a.sha256, b.sha256);
  assert_eq!(a.tree_hash, b.tree_hash);
  assert_eq!(a.size, b.size);
}

#[tokio::test]
async fn library_on_any_is_rejected_before_any_workspace() {
  let env = TestEnv::new();
  let mut r = recipe(HELLO_SCRIPT);
  r.platforms = vec![Platform::Any];
  r.products = vec![Product::library("hello", "libhello")];

  let err = autobuild(&r, &env.context()).await.unwrap_err();

  assert!(matches!(err, BuildError::Validation(ValidationError::Product(_))));
  assert!(!env.work_dir().exists());
  assert!(!env.out_dir().exists());
}

#[tokio::test]
async fn any_platform_builds_platform_independent_files() {
  let env = TestEnv::new();
  let mut r = recipe(
    r#"
mkdir -p "$prefix/share/hello" "$prefix/share/licenses/hello"
echo data > "$prefix/share/hello/data.txt"
echo MIT > "$prefix/share/licenses/hello/LICENSE"
"#,
  );
  r.platforms = vec![Platform::Any];
  r.products = vec![Product::file("share/hello/data.txt", "data")];

  let report = autobuild(&r, &env.context()).await.unwrap();

  assert!(report.is_success(), "{:?}", report.failures);
  assert!(
    report.artifacts[&Platform::Any]
      .archive_path
      .ends_with("hello.v1.0.0.any.tar.gz")
  );
}

#[tokio::test]
async fn failing_script_keeps_its_output() {
  let env = TestEnv::new();
  let report = autobuild(&recipe("echo boom >&2\nexit 3\n"), &env.context())
    .await
    .unwrap();

  match &report.failures[&linux()] {
    PlatformFailure::RunFailed { exit_code, output, cancelled } => {
      assert_eq!(*exit_code, Some(3));
      assert!(output.contains("boom"));
      assert!(!cancelled);
    }
    other => panic!("unexpected failure: {other:?}"),
  }
  assert!(report.artifacts.is_empty());
}

#[tokio::test]
async fn timeout_is_reported() {
  let env = TestEnv::new();
  let ctx = env.context_with(|options| options.timeout = Some(std::time::Duration::from_millis(200)));

  let report = autobuild(&recipe("sleep 30\n"), &ctx).await.unwrap();

  assert_eq!(report.failures[&linux()].kind(), "RunTimedOut");
}

#[tokio::test]
async fn kept_workspace_survives() {
  let env = TestEnv::new();
  let ctx = env.context_with(|options| options.keep_workspace = true);

  let report = autobuild(&recipe(HELLO_SCRIPT), &ctx).await.unwrap();

  let root = &report.retained_workspaces[&linux()];
  assert!(root.starts_with(env.work_dir()));
  assert!(root.join("destdir/bin/hello").is_file());
}
