//! Static inspection of a built prefix.
//!
//! Every regular file whose signature identifies it as ELF, Mach-O or PE is
//! parsed and checked, in order, for:
//!
//! 1. object format and machine type against the target platform,
//! 2. libraries that nobody provides (the package itself, a staged
//!    dependency or the platform's allow-list), warning about compiler
//!    runtimes that only the allow-list covers,
//! 3. Fortran and C++ runtime ABI against the platform's ABI tags,
//! 4. absolute search paths, which are rewritten to loader-relative ones.
//!
//! Finally the prefix must carry a license under `share/licenses/<name>`.
//! The audit only ever reads and rewrites files inside the prefix.

pub mod binary;
pub mod policy;
mod types;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use binary::{BinaryFormat, BinaryInfo, FormatKind, RewritePlan, detect_format};
pub use policy::AuditPolicy;
pub use types::{AuditCategory, AuditFinding, AuditReport, Severity};

use crate::consts::LICENSE_DIR;
use crate::platform::{Arch, Os, Platform};
use crate::util::fs::{normalize_relative, relative_path};
use policy::file_name;

#[derive(Debug, Error)]
pub enum AuditError {
  #[error("failed to load audit policy '{path}': {message}")]
  Policy { path: PathBuf, message: String },

  #[error("{0}")]
  Parse(String),

  #[error("failed to run '{tool}': {source}")]
  Tool {
    tool: String,
    #[source]
    source: io::Error,
  },

  #[error("'{tool}' failed: {message}")]
  ToolFailed { tool: String, message: String },

  #[error("I/O error: {0}")]
  Io(#[from] io::Error),
}

/// Everything the audit consults besides the prefix.
pub struct AuditContext<'a> {
  /// Package name; licenses live under `share/licenses/<package>`.
  pub package: &'a str,
  pub policy: &'a AuditPolicy,
  /// Library name → library directory, for libraries staged dependencies
  /// provide. See [`provided_libraries`].
  pub dependency_libraries: &'a BTreeMap<String, PathBuf>,
  /// Absolute paths that stood for the prefix while building (e.g. the
  /// sandbox mount point). Search paths below them are relocatable.
  pub install_roots: &'a [PathBuf],
}

struct Binary {
  relative: PathBuf,
  path: PathBuf,
  format: &'static dyn BinaryFormat,
  info: BinaryInfo,
}

/// Audit `prefix` as the output of a build for `platform`.
pub fn audit(prefix: &Path, platform: &Platform, ctx: &AuditContext<'_>) -> AuditReport {
  let mut report = AuditReport::new();

  match (platform.arch(), platform.os()) {
    (Some(arch), Some(os)) => {
      let binaries = scan_binaries(prefix, &mut report);

      let mut own = provided_libraries(prefix, platform);
      for binary in &binaries {
        if let Some(soname) = &binary.info.soname {
          let dir = binary.relative.parent().map(Path::to_path_buf).unwrap_or_default();
          own.entry(file_name(soname).to_string()).or_insert(dir);
        }
      }

      for binary in &binaries {
        debug!(path = %binary.relative.display(), format = %binary.info.kind, libraries = ?binary.info.libraries, "auditing binary");
        if !check_isa(binary, arch, os, &mut report) {
          continue;
        }
        check_linkage(binary, platform, &own, ctx, &mut report);
        check_runtimes(binary, platform, ctx.policy, &mut report);
        if ctx.policy.rewrite_search_paths {
          relocate(binary, prefix, &own, ctx, &mut report);
        }
      }
    }
    _ => debug!(prefix = %prefix.display(), "platform-independent build; skipping binary checks"),
  }

  check_license(prefix, ctx.package, &mut report);

  info!(
    platform = %platform,
    findings = report.findings().len(),
    fatal = report.has_fatal(),
    "audit finished"
  );
  report
}

/// Shared libraries found in `root`'s library directories, by file name and
/// SONAME, mapped to the directory holding them.
pub fn provided_libraries(root: &Path, platform: &Platform) -> BTreeMap<String, PathBuf> {
  let mut provided = BTreeMap::new();

  for dir in platform.library_dirs() {
    let Ok(entries) = fs::read_dir(root.join(dir)) else {
      continue;
    };
    for entry in entries.flatten() {
      let name = entry.file_name().to_string_lossy().to_string();
      provided.entry(name).or_insert_with(|| PathBuf::from(dir));

      if let Ok(bytes) = fs::read(entry.path())
        && let Some(format) = detect_format(&bytes)
        && let Ok(info) = format.inspect(&bytes)
        && let Some(soname) = info.soname
      {
        provided
          .entry(file_name(&soname).to_string())
          .or_insert_with(|| PathBuf::from(dir));
      }
    }
  }

  provided
}

fn read_signature(path: &Path) -> io::Result<Vec<u8>> {
  let mut buf = Vec::with_capacity(binary::SIGNATURE_LEN);
  fs::File::open(path)?
    .take(binary::SIGNATURE_LEN as u64)
    .read_to_end(&mut buf)?;
  Ok(buf)
}

fn scan_binaries(prefix: &Path, report: &mut AuditReport) -> Vec<Binary> {
  let mut binaries = Vec::new();

  for entry in WalkDir::new(prefix).follow_links(false).sort_by_file_name() {
    let entry = match entry {
      Ok(entry) => entry,
      Err(e) => {
        let path = e.path().and_then(|p| p.strip_prefix(prefix).ok()).map(Path::to_path_buf).unwrap_or_default();
        warn!(error = %e, "unreadable prefix entry");
        report.push(Severity::Warning, path, AuditCategory::UnparseableBinary, e.to_string());
        continue;
      }
    };
    if !entry.file_type().is_file() {
      continue;
    }

    let path = entry.path();
    let relative = path.strip_prefix(prefix).unwrap_or(path).to_path_buf();
    let candidate = read_signature(path).map(|sig| binary::has_signature(&sig)).unwrap_or(false);
    if !candidate {
      continue;
    }

    let inspected = fs::read(path).map_err(AuditError::from).and_then(|bytes| {
      let format = detect_format(&bytes).ok_or_else(|| AuditError::Parse("unrecognised object format".to_string()))?;
      format.inspect(&bytes).map(|info| (format, info))
    });

    match inspected {
      Ok((format, info)) => binaries.push(Binary {
        relative,
        path: path.to_path_buf(),
        format,
        info,
      }),
      Err(e) => {
        warn!(path = %relative.display(), error = %e, "could not parse binary");
        report.push(Severity::Warning, relative, AuditCategory::UnparseableBinary, e.to_string());
      }
    }
  }

  binaries
}

/// Returns `false` when the binary is for another platform altogether.
fn check_isa(binary: &Binary, arch: Arch, os: Os, report: &mut AuditReport) -> bool {
  let info = &binary.info;
  let expected = FormatKind::native_to(os);
  if info.kind != expected {
    report.push(
      Severity::Fatal,
      &binary.relative,
      AuditCategory::IsaMismatch,
      format!("{} binary in a {} build, expected {}", info.kind, os, expected),
    );
    return false;
  }

  if !info.matches_arch(arch) {
    let found = match info.arch {
      Some(own) => own.to_string(),
      None => format!("unknown machine {:#x}", info.machine),
    };
    report.push(
      Severity::Fatal,
      &binary.relative,
      AuditCategory::IsaMismatch,
      format!("built for {} but the platform is {}", found, arch),
    );
    return false;
  }

  true
}

fn is_known(set: &BTreeMap<String, PathBuf>, name: &str, case_insensitive: bool) -> bool {
  if case_insensitive {
    set.keys().any(|k| k.eq_ignore_ascii_case(name))
  } else {
    set.contains_key(name)
  }
}

fn check_linkage(
  binary: &Binary,
  platform: &Platform,
  own: &BTreeMap<String, PathBuf>,
  ctx: &AuditContext<'_>,
  report: &mut AuditReport,
) {
  let windows = platform.is_windows();
  for lib in &binary.info.libraries {
    let name = file_name(lib);
    if is_known(own, name, windows) || is_known(ctx.dependency_libraries, name, windows) {
      continue;
    }
    if ctx.policy.allows(platform, lib) {
      if ctx.policy.is_runtime_support(lib) {
        report.push(
          Severity::Warning,
          &binary.relative,
          AuditCategory::MissingRuntimeDependency,
          format!(
            "links compiler runtime '{}' that no declared dependency provides; declare the dependency that ships it",
            lib
          ),
        );
      }
      continue;
    }
    report.push(
      Severity::Fatal,
      &binary.relative,
      AuditCategory::DisallowedLinkage,
      format!("links '{}', which is neither built here, provided by a dependency nor allowed on {}", lib, platform),
    );
  }
}

fn check_runtimes(binary: &Binary, platform: &Platform, policy: &AuditPolicy, report: &mut AuditReport) {
  let info = &binary.info;

  for lib in &info.libraries {
    let Some(version) = policy.gfortran_version(lib) else {
      continue;
    };
    match platform.libgfortran_version() {
      Some(expected) if expected != version => report.push(
        Severity::Fatal,
        &binary.relative,
        AuditCategory::AbiMismatch,
        format!("links {} ({}) but the platform requires {}", lib, version, expected),
      ),
      Some(_) => {}
      None => report.push(
        Severity::Warning,
        &binary.relative,
        AuditCategory::MissingRuntimeDependency,
        format!(
          "links {} ({}) while the platform leaves the libgfortran version open; expand the platform list over libgfortran versions",
          lib, version
        ),
      ),
    }
  }

  let links_cxx = info.libraries.iter().any(|l| policy.is_cxx_runtime(l));
  if let (true, Some(abi)) = (links_cxx, info.cxx_string_abi) {
    match platform.cxxstring_abi() {
      Some(expected) if expected != abi => report.push(
        Severity::Fatal,
        &binary.relative,
        AuditCategory::AbiMismatch,
        format!("uses the {} string ABI but the platform requires {}", abi, expected),
      ),
      Some(_) => {}
      None => report.push(
        Severity::Warning,
        &binary.relative,
        AuditCategory::MissingRuntimeDependency,
        format!(
          "uses the {} string ABI while the platform leaves it open; expand the platform list over C++ string ABIs",
          abi
        ),
      ),
    }
  }
}

fn is_loader_relative(entry: &str) -> bool {
  ["$ORIGIN", "${ORIGIN}", "@loader_path", "@executable_path", "@rpath"]
    .iter()
    .any(|token| entry.starts_with(token))
}

fn push_unique(list: &mut Vec<String>, entry: String) {
  if !list.contains(&entry) {
    list.push(entry);
  }
}

fn relocation_plan(
  binary: &Binary,
  origin: &str,
  prefix: &Path,
  own: &BTreeMap<String, PathBuf>,
  ctx: &AuditContext<'_>,
) -> Option<RewritePlan> {
  let info = &binary.info;
  let bin_dir = binary.relative.parent().unwrap_or(Path::new(""));

  let inside = |entry: &str| -> Option<PathBuf> {
    let path = Path::new(entry);
    if !path.is_absolute() {
      return None;
    }
    std::iter::once(prefix)
      .chain(ctx.install_roots.iter().map(PathBuf::as_path))
      .find_map(|root| path.strip_prefix(root).ok())
      .and_then(normalize_relative)
  };
  let loader_relative = |dir: &Path| -> String {
    let parts: Vec<String> = relative_path(bin_dir, dir)
      .components()
      .map(|c| c.as_os_str().to_string_lossy().into_owned())
      .collect();
    if parts.is_empty() {
      origin.to_string()
    } else {
      format!("{}/{}", origin, parts.join("/"))
    }
  };

  let mut plan = RewritePlan::default();

  for entry in &info.search_paths {
    if is_loader_relative(entry) {
      push_unique(&mut plan.search_paths, entry.clone());
    } else if let Some(dir) = inside(entry) {
      push_unique(&mut plan.search_paths, loader_relative(&dir));
    } else {
      debug!(path = %binary.relative.display(), entry, "dropping search path outside the prefix");
    }
  }

  for lib in &info.libraries {
    let name = file_name(lib);
    let Some(dir) = own.get(name).or_else(|| ctx.dependency_libraries.get(name)) else {
      continue;
    };
    if lib.starts_with("@loader_path") || lib.starts_with("@executable_path") {
      continue;
    }
    if Path::new(lib).is_absolute() {
      if inside(lib).is_none() {
        continue;
      }
      if info.kind == FormatKind::MachO {
        plan.renamed_libraries.push((lib.clone(), format!("@rpath/{}", name)));
      }
    }
    push_unique(&mut plan.search_paths, loader_relative(dir));
  }

  if info.kind == FormatKind::MachO
    && let Some(id) = &info.soname
    && inside(id).is_some()
  {
    plan.install_name = Some(format!("@rpath/{}", file_name(id)));
  }

  let unchanged = plan.search_paths == info.search_paths && plan.renamed_libraries.is_empty() && plan.install_name.is_none();
  (!unchanged).then_some(plan)
}

fn relocate(
  binary: &Binary,
  prefix: &Path,
  own: &BTreeMap<String, PathBuf>,
  ctx: &AuditContext<'_>,
  report: &mut AuditReport,
) {
  let Some(origin) = binary.format.origin() else {
    return;
  };
  let Some(plan) = relocation_plan(binary, origin, prefix, own, ctx) else {
    return;
  };

  match binary.format.rewrite_search_paths(&binary.path, &binary.info, &plan, ctx.policy) {
    Ok(()) => info!(path = %binary.relative.display(), search_paths = ?plan.search_paths, "made binary relocatable"),
    Err(e) => report.push(
      Severity::Fatal,
      &binary.relative,
      AuditCategory::Unrelocatable,
      format!("could not rewrite search path '{}': {}", binary.info.search_paths.join(":"), e),
    ),
  }
}

fn check_license(prefix: &Path, package: &str, report: &mut AuditReport) {
  let relative = Path::new(LICENSE_DIR).join(package);
  let path = prefix.join(&relative);

  let present = match fs::read_dir(&path) {
    Ok(mut entries) => entries.next().is_some(),
    Err(_) => path.is_file(),
  };
  if !present {
    report.push(
      Severity::Warning,
      relative,
      AuditCategory::MissingLicense,
      format!("no license installed for '{}'", package),
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::{CxxStringAbi, GfortranVersion};
  use crate::util::testutil::{CPU_TYPE_X86_64, EM_AARCH64, EM_X86_64, ElfFixture, MachOFixture, write_file};
  use tempfile::TempDir;

  fn linux() -> Platform {
    Platform::new(Arch::X86_64, Os::Linux)
  }

  fn inspect_file(path: &Path) -> BinaryInfo {
    let bytes = fs::read(path).unwrap();
    detect_format(&bytes).unwrap().inspect(&bytes).unwrap()
  }

  struct Fixture {
    prefix: TempDir,
    policy: AuditPolicy,
    deps: BTreeMap<String, PathBuf>,
    roots: Vec<PathBuf>,
  }

  impl Fixture {
    fn new() -> Self {
      let prefix = TempDir::new().unwrap();
      write_file(prefix.path(), "share/licenses/pkg/LICENSE", b"MIT");
      Fixture {
        prefix,
        policy: AuditPolicy::default(),
        deps: BTreeMap::new(),
        roots: vec![PathBuf::from("/workspace/destdir")],
      }
    }

    fn path(&self, rel: &str) -> PathBuf {
      self.prefix.path().join(rel)
    }

    fn audit(&self, platform: &Platform) -> AuditReport {
      audit(
        self.prefix.path(),
        platform,
        &AuditContext {
          package: "pkg",
          policy: &self.policy,
          dependency_libraries: &self.deps,
          install_roots: &self.roots,
        },
      )
    }
  }

  #[test]
  fn clean_prefix_has_no_findings() {
    let fx = Fixture::new();
    ElfFixture::library(EM_X86_64, "libfoo.so.1")
      .needs("libc.so.6")
      .write_to(&fx.path("lib/libfoo.so.1"));
    ElfFixture::executable(EM_X86_64)
      .needs("libfoo.so.1")
      .needs("libc.so.6")
      .runpath("$ORIGIN/../lib")
      .write_to(&fx.path("bin/tool"));
    write_file(fx.prefix.path(), "include/foo.h", b"int foo(void);\n");

    let report = fx.audit(&linux());
    assert!(report.is_empty(), "{:?}", report.findings());
  }

  #[test]
  fn undeclared_linkage_is_fatal() {
    let mut fx = Fixture::new();
    ElfFixture::executable(EM_X86_64)
      .needs("libssl.so.3")
      .write_to(&fx.path("bin/tool"));

    let report = fx.audit(&linux());
    assert!(report.has_fatal());
    let finding = report.first_fatal().unwrap();
    assert_eq!(finding.category, AuditCategory::DisallowedLinkage);
    assert_eq!(finding.path, PathBuf::from("bin/tool"));
    assert!(finding.message.contains("libssl.so.3"));

    fx.deps.insert("libssl.so.3".to_string(), PathBuf::from("lib"));
    let report = fx.audit(&linux());
    assert_eq!(report.in_category(AuditCategory::DisallowedLinkage).count(), 0);
  }

  #[test]
  fn foreign_binaries_are_isa_mismatches() {
    let fx = Fixture::new();
    ElfFixture::executable(EM_AARCH64).write_to(&fx.path("bin/arm-tool"));
    MachOFixture::executable(CPU_TYPE_X86_64).write_to(&fx.path("bin/mac-tool"));

    let report = fx.audit(&linux());
    let paths: Vec<_> = report
      .in_category(AuditCategory::IsaMismatch)
      .map(|f| f.path.to_string_lossy().to_string())
      .collect();
    assert_eq!(paths, vec!["bin/arm-tool", "bin/mac-tool"]);
    assert!(report.has_fatal());
  }

  #[test]
  fn undeclared_compiler_runtime_is_a_warning() {
    let mut fx = Fixture::new();
    ElfFixture::executable(EM_X86_64)
      .needs("libgomp.so.1")
      .needs("libc.so.6")
      .write_to(&fx.path("bin/solver"));

    let report = fx.audit(&linux());
    assert!(!report.has_fatal());
    let warnings: Vec<_> = report.in_category(AuditCategory::MissingRuntimeDependency).collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, Severity::Warning);
    assert!(warnings[0].message.contains("libgomp.so.1"));

    fx.policy.rewrite_search_paths = false;
    fx.deps.insert("libgomp.so.1".to_string(), PathBuf::from("lib"));
    assert!(fx.audit(&linux()).is_empty());
  }

  #[test]
  fn gfortran_runtime_must_match_platform() {
    let mut fx = Fixture::new();
    ElfFixture::executable(EM_X86_64)
      .needs("libgfortran.so.5")
      .write_to(&fx.path("bin/solver"));
    let matching = linux().with_libgfortran_version(GfortranVersion(5));

    let undeclared = fx.audit(&matching);
    assert!(!undeclared.has_fatal());
    assert_eq!(undeclared.in_category(AuditCategory::MissingRuntimeDependency).count(), 1);

    fx.policy.rewrite_search_paths = false;
    fx.deps.insert("libgfortran.so.5".to_string(), PathBuf::from("lib"));

    let pinned = linux().with_libgfortran_version(GfortranVersion(4));
    let report = fx.audit(&pinned);
    assert_eq!(report.first_fatal().unwrap().category, AuditCategory::AbiMismatch);

    assert!(fx.audit(&matching).is_empty());

    let open = fx.audit(&linux());
    assert!(!open.has_fatal());
    assert_eq!(open.in_category(AuditCategory::MissingRuntimeDependency).count(), 1);
  }

  #[test]
  fn cxx_string_abi_must_match_platform() {
    let mut fx = Fixture::new();
    ElfFixture::executable(EM_X86_64)
      .needs("libstdc++.so.6")
      .symbol("_ZNKSt7__cxx1112basic_stringIcSt11char_traitsIcESaIcEE4sizeEv")
      .write_to(&fx.path("bin/app"));
    fx.policy.rewrite_search_paths = false;
    fx.deps.insert("libstdc++.so.6".to_string(), PathBuf::from("lib"));

    let cxx03 = linux().with_cxxstring_abi(CxxStringAbi::Cxx03);
    let report = fx.audit(&cxx03);
    let fatal = report.first_fatal().unwrap();
    assert_eq!(fatal.category, AuditCategory::AbiMismatch);
    assert!(fatal.message.contains("cxx11"));

    assert!(fx.audit(&linux().with_cxxstring_abi(CxxStringAbi::Cxx11)).is_empty());
  }

  #[test]
  fn absolute_runpaths_become_origin_relative() {
    let fx = Fixture::new();
    let build_runpath = format!("{}/lib:/opt/toolchain/lib", fx.prefix.path().display());
    ElfFixture::library(EM_X86_64, "libfoo.so").write_to(&fx.path("lib/libfoo.so"));
    ElfFixture::executable(EM_X86_64)
      .needs("libfoo.so")
      .runpath(&build_runpath)
      .write_to(&fx.path("bin/tool"));
    ElfFixture::executable(EM_X86_64)
      .needs("libfoo.so")
      .runpath("/workspace/destdir/lib")
      .write_to(&fx.path("libexec/pkg/helper"));

    let report = fx.audit(&linux());
    assert!(report.is_empty(), "{:?}", report.findings());

    let tool = inspect_file(&fx.path("bin/tool"));
    assert_eq!(tool.search_paths, vec!["$ORIGIN/../lib"]);
    let helper = inspect_file(&fx.path("libexec/pkg/helper"));
    assert_eq!(helper.search_paths, vec!["$ORIGIN/../../lib"]);
  }

  #[test]
  fn unrewritable_binary_is_unrelocatable() {
    let mut fx = Fixture::new();
    fx.roots = vec![PathBuf::from("/w")];
    fx.policy.patchelf = fx.prefix.path().join("missing-patchelf");
    ElfFixture::library(EM_X86_64, "libfoo.so").write_to(&fx.path("lib/libfoo.so"));
    ElfFixture::executable(EM_X86_64)
      .needs("libfoo.so")
      .runpath("/w/lib")
      .write_to(&fx.path("bin/tool"));

    let report = fx.audit(&linux());
    assert_eq!(report.first_fatal().unwrap().category, AuditCategory::Unrelocatable);
  }

  #[test]
  fn missing_license_is_a_warning() {
    let fx = Fixture::new();
    fs::remove_dir_all(fx.path("share")).unwrap();

    let report = fx.audit(&linux());
    assert!(!report.has_fatal());
    let finding = report.in_category(AuditCategory::MissingLicense).next().unwrap();
    assert_eq!(finding.severity, Severity::Warning);
    assert_eq!(finding.path, PathBuf::from("share/licenses/pkg"));
  }

  #[test]
  fn unparseable_binary_is_reported() {
    let fx = Fixture::new();
    write_file(fx.prefix.path(), "bin/broken", b"\x7fELF\x02\x01\x01\0garbage");

    let report = fx.audit(&linux());
    let finding = report.in_category(AuditCategory::UnparseableBinary).next().unwrap();
    assert_eq!(finding.path, PathBuf::from("bin/broken"));
    assert_eq!(finding.severity, Severity::Warning);
  }

  #[test]
  fn platform_independent_builds_skip_binary_checks() {
    let fx = Fixture::new();
    ElfFixture::executable(EM_AARCH64)
      .needs("libssl.so.3")
      .write_to(&fx.path("share/pkg/blob"));

    assert!(fx.audit(&Platform::Any).is_empty());
  }

  #[test]
  fn provided_libraries_include_sonames() {
    let root = TempDir::new().unwrap();
    ElfFixture::library(EM_X86_64, "libz.so.1").write_to(&root.path().join("lib/libz.so.1.3.1"));
    write_file(root.path(), "lib64/libbar.so", b"not really");

    let provided = provided_libraries(root.path(), &linux());
    assert_eq!(provided.get("libz.so.1"), Some(&PathBuf::from("lib")));
    assert_eq!(provided.get("libz.so.1.3.1"), Some(&PathBuf::from("lib")));
    assert_eq!(provided.get("libbar.so"), Some(&PathBuf::from("lib64")));
  }
}
