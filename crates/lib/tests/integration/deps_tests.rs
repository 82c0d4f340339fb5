//! Dependency resolution as seen through a whole build.

use crossbake_lib::deps::{DependencyError, DependencyFailure, DependencyRequest};
use crossbake_lib::package;
use crossbake_lib::platform::{Arch, Os, Platform};
use crossbake_lib::products::Product;
use crossbake_lib::{PlatformFailure, autobuild};
use tempfile::TempDir;

use super::common::{HELLO_SCRIPT, TestEnv, linux, recipe};

fn zlib_header() -> Product {
  Product::file("include/zlib.h", "zlib_h")
}

#[tokio::test]
async fn staged_dependencies_are_exported_but_not_packaged() {
  let env = TestEnv::new();
  env.publish("zlib", &linux(), &[("include/zlib.h", "/* zlib */\n")], &[zlib_header()]);

  let mut r = recipe(&format!("test -f \"$dep_zlib_h\"\n{}", HELLO_SCRIPT));
  r.dependencies = vec![DependencyRequest::target("zlib")];
  let report = autobuild(&r, &env.context()).await.unwrap();

  assert!(report.is_success(), "{:?}", report.failures);
  let artifact = &report.artifacts[&linux()];
  let dest = TempDir::new().unwrap();
  package::install(&artifact.archive_path, &artifact.sha256.0, dest.path()).unwrap();
  assert!(dest.path().join("bin/hello").is_file());
  assert!(!dest.path().join("include/zlib.h").exists());
}

#[tokio::test]
async fn every_unavailable_dependency_is_listed() {
  let env = TestEnv::new();
  env.publish("zlib", &linux(), &[("include/zlib.h", "/* zlib */\n")], &[zlib_header()]);

  let mut r = recipe(HELLO_SCRIPT);
  r.dependencies = vec![
    DependencyRequest::target("zlib"),
    DependencyRequest::target("nonexistent-a"),
    DependencyRequest::host("nonexistent-b"),
  ];
  let report = autobuild(&r, &env.context()).await.unwrap();

  let PlatformFailure::Dependencies(DependencyError::UnsatisfiedDependencies { failures }) = &report.failures[&linux()]
  else {
    panic!("unexpected failure: {:?}", report.failures);
  };
  let packages: Vec<&str> = failures
    .iter()
    .map(|f| match f {
      DependencyFailure::Lookup { package, .. } | DependencyFailure::Staging { package, .. } => package.as_str(),
    })
    .collect();
  assert_eq!(packages, vec!["nonexistent-a", "nonexistent-b"]);
}

#[tokio::test]
async fn host_incompatible_dependency_fails_deterministically() {
  let mac = Platform::new(Arch::Aarch64, Os::MacOs);
  let mut r = recipe(HELLO_SCRIPT);
  r.dependencies = vec![DependencyRequest::host("cmake").pinned(mac.clone())];

  // The outcome must not depend on what the catalog holds.
  let empty = TestEnv::new();
  let stocked = TestEnv::new();
  stocked.publish("cmake", &mac, &[("bin/cmake", "#!/bin/sh\n")], &[]);

  for env in [&empty, &stocked] {
    let report = autobuild(&r, &env.context()).await.unwrap();
    let failure = &report.failures[&linux()];
    assert_eq!(failure.kind(), "HostIncompatible");
    assert!(failure.to_string().contains("cmake"));
  }
}
