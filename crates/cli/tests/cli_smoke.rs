//! CLI smoke tests for cbake.
//!
//! These tests exercise argument handling and the failure paths that do not
//! need a cross toolchain.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn cbake_cmd() -> Command {
  cargo_bin_cmd!("cbake")
}

/// Write `recipe.toml` into a fresh temp directory.
fn temp_recipe(content: &str) -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("recipe.toml"), content).unwrap();
  temp
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  cbake_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  cbake_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("cbake"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["build", "platforms"] {
    cbake_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// platforms
// =============================================================================

#[test]
fn platforms_lists_triplets() {
  cbake_cmd()
    .arg("platforms")
    .assert()
    .success()
    .stdout(predicate::str::contains("x86_64-linux-gnu"))
    .stdout(predicate::str::contains("aarch64-apple-darwin"));
}

#[test]
fn platforms_json_is_valid() {
  let output = cbake_cmd().args(["platforms", "--output", "json"]).output().unwrap();
  assert!(output.status.success());

  let items: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let items = items.as_array().unwrap();
  assert!(items.iter().any(|i| i["triplet"] == "x86_64-w64-mingw32"));
}

// =============================================================================
// build
// =============================================================================

#[test]
fn build_missing_recipe_fails() {
  let temp = TempDir::new().unwrap();
  cbake_cmd()
    .arg("build")
    .arg(temp.path().join("nope.toml"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed to load recipe"));
}

#[test]
fn build_rejects_invalid_recipe_before_creating_workspaces() {
  let temp = temp_recipe(
    r#"
name = "data"
version = "1.0.0"
platforms = ["any"]
script = "true"

[[products]]
kind = "library"
name = "data"
symbol = "libdata"
"#,
  );
  let work = temp.path().join("work");

  cbake_cmd()
    .arg("build")
    .arg(temp.path().join("recipe.toml"))
    .arg("--work-dir")
    .arg(&work)
    .arg("--out-dir")
    .arg(temp.path().join("out"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid recipe"));

  assert!(!work.exists());
}

#[test]
fn build_reports_unsatisfied_dependencies() {
  let temp = temp_recipe(
    r#"
name = "hello"
version = "1.0.0"
platforms = ["x86_64-linux-gnu"]
script = "true"

[[dependencies]]
package = "does-not-exist"
"#,
  );

  cbake_cmd()
    .arg("build")
    .arg(temp.path().join("recipe.toml"))
    .arg("--catalog")
    .arg(temp.path().join("catalog"))
    .arg("--work-dir")
    .arg(temp.path().join("work"))
    .arg("--out-dir")
    .arg(temp.path().join("out"))
    .arg("--unconfined")
    .assert()
    .failure()
    .stderr(predicate::str::contains("UnsatisfiedDependencies"))
    .stderr(predicate::str::contains("does-not-exist"));
}
