//! Allow-lists and runtime ABI rules for the audit.
//!
//! Defaults cover the system libraries every toolchain image links
//! against. A policy file replaces individual fields:
//!
//! ```json
//! {
//!   "allowed_libraries": { "linux": ["libc.so.6", "ld-linux-*"] },
//!   "patchelf": "/opt/patchelf/bin/patchelf"
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::AuditError;
use crate::platform::{GfortranVersion, Os, Platform};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditPolicy {
  /// Libraries a binary may link without anyone providing them, keyed by
  /// OS name. `*` matches any run of characters.
  pub allowed_libraries: BTreeMap<String, Vec<String>>,
  /// Library file name → Fortran runtime major version it belongs to.
  pub gfortran_runtimes: BTreeMap<String, GfortranVersion>,
  /// Library file names of the GNU C++ runtime.
  pub cxx_runtimes: Vec<String>,
  /// Compiler runtime libraries a package should get from a declared
  /// dependency even though the allow-list lets them through.
  pub runtime_support: Vec<String>,
  pub patchelf: PathBuf,
  pub install_name_tool: PathBuf,
  /// Rewrite absolute search paths to loader-relative ones.
  pub rewrite_search_paths: bool,
}

impl Default for AuditPolicy {
  fn default() -> Self {
    let allowed = |libs: &[&str]| libs.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    let mut allowed_libraries = BTreeMap::new();
    allowed_libraries.insert(
      Os::Linux.as_str().to_string(),
      allowed(&[
        "libc.so.6",
        "libm.so.6",
        "libdl.so.2",
        "librt.so.1",
        "libpthread.so.0",
        "libutil.so.1",
        "libresolv.so.2",
        "ld-linux*.so.*",
        "ld64.so.*",
        "libc.musl-*.so.1",
        "libc.so",
        "libgcc_s.so.1",
        "libstdc++.so.6",
        "libgomp.so.1",
        "libquadmath.so.0",
        "libatomic.so.1",
        "libgfortran.so.*",
      ]),
    );
    allowed_libraries.insert(
      Os::MacOs.as_str().to_string(),
      allowed(&[
        "/usr/lib/libSystem.B.dylib",
        "/usr/lib/libc++.1.dylib",
        "/usr/lib/libc++abi.dylib",
        "/usr/lib/libobjc.A.dylib",
        "/usr/lib/libresolv.9.dylib",
        "/usr/lib/libiconv.2.dylib",
        "/System/Library/Frameworks/*",
        "libgcc_s.1.dylib",
        "libgcc_s.1.1.dylib",
        "libstdc++.6.dylib",
        "libgomp.1.dylib",
        "libquadmath.0.dylib",
        "libgfortran.*.dylib",
      ]),
    );
    allowed_libraries.insert(
      Os::Windows.as_str().to_string(),
      allowed(&[
        "kernel32.dll",
        "user32.dll",
        "gdi32.dll",
        "advapi32.dll",
        "shell32.dll",
        "ole32.dll",
        "oleaut32.dll",
        "ws2_32.dll",
        "bcrypt.dll",
        "crypt32.dll",
        "msvcrt.dll",
        "ucrtbase.dll",
        "api-ms-win-*.dll",
        "libgcc_s_seh-1.dll",
        "libgcc_s_sjlj-1.dll",
        "libwinpthread-1.dll",
        "libstdc++-6.dll",
        "libgomp-1.dll",
        "libquadmath-0.dll",
        "libgfortran-*.dll",
      ]),
    );
    allowed_libraries.insert(
      Os::FreeBsd.as_str().to_string(),
      allowed(&[
        "libc.so.7",
        "libm.so.5",
        "libthr.so.3",
        "libutil.so.9",
        "libgcc_s.so.1",
        "libc++.so.1",
        "libcxxrt.so.1",
        "libgfortran.so.*",
      ]),
    );

    let mut gfortran_runtimes = BTreeMap::new();
    for v in GfortranVersion::ALL {
      gfortran_runtimes.insert(format!("libgfortran.so.{}", v.0), v);
      gfortran_runtimes.insert(format!("libgfortran.{}.dylib", v.0), v);
      gfortran_runtimes.insert(format!("libgfortran-{}.dll", v.0), v);
    }

    AuditPolicy {
      allowed_libraries,
      gfortran_runtimes,
      cxx_runtimes: allowed(&["libstdc++.so.6", "libstdc++.6.dylib", "libstdc++-6.dll"]),
      runtime_support: allowed(&["libgfortran*", "libstdc++*", "libgomp*", "libquadmath*"]),
      patchelf: PathBuf::from("patchelf"),
      install_name_tool: PathBuf::from("install_name_tool"),
      rewrite_search_paths: true,
    }
  }
}

impl AuditPolicy {
  pub fn from_json_file(path: &Path) -> Result<Self, AuditError> {
    let content = fs::read_to_string(path).map_err(|e| AuditError::Policy {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| AuditError::Policy {
      path: path.to_path_buf(),
      message: e.to_string(),
    })
  }

  /// Whether `library` (as recorded in the binary) may be linked on
  /// `platform` without being provided.
  pub fn allows(&self, platform: &Platform, library: &str) -> bool {
    let Some(os) = platform.os() else {
      return false;
    };
    let Some(patterns) = self.allowed_libraries.get(os.as_str()) else {
      return false;
    };

    // PE import names are case-insensitive.
    let fold = |s: &str| if os == Os::Windows { s.to_ascii_lowercase() } else { s.to_string() };
    let full = fold(library);
    let base = fold(file_name(library));
    patterns.iter().any(|p| {
      let p = fold(p);
      glob_match(&p, &full) || glob_match(&p, &base)
    })
  }

  pub fn gfortran_version(&self, library: &str) -> Option<GfortranVersion> {
    self.gfortran_runtimes.get(file_name(library)).copied()
  }

  pub fn is_cxx_runtime(&self, library: &str) -> bool {
    let name = file_name(library);
    self.cxx_runtimes.iter().any(|r| r == name)
  }

  pub fn is_runtime_support(&self, library: &str) -> bool {
    let name = file_name(library).to_ascii_lowercase();
    self
      .runtime_support
      .iter()
      .any(|p| glob_match(&p.to_ascii_lowercase(), &name))
  }
}

/// Last path component of a library reference (`@rpath/libz.1.dylib` → `libz.1.dylib`).
pub fn file_name(library: &str) -> &str {
  library.rsplit(['/', '\\']).next().unwrap_or(library)
}

fn glob_match(pattern: &str, text: &str) -> bool {
  let mut parts = pattern.split('*');
  let first = parts.next().unwrap_or_default();
  let Some(mut rest) = text.strip_prefix(first) else {
    return false;
  };
  let parts: Vec<&str> = parts.collect();
  let Some((last, middle)) = parts.split_last() else {
    return rest.is_empty();
  };
  for part in middle {
    match rest.find(part) {
      Some(at) => rest = &rest[at + part.len()..],
      None => return false,
    }
  }
  rest.ends_with(last)
}
