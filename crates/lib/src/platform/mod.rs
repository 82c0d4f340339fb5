//! Target platform model.
//!
//! A [`Platform`] is either the [`Platform::Any`] sentinel or a concrete
//! [`Target`] made of architecture, OS, libc, call ABI, optional ABI
//! sub-versions and free-form tags. Platforms round-trip through their
//! canonical triplet string:
//!
//! ```text
//! <arch>-<os-part>[-libgfortran<N>][-<cxx03|cxx11>][-<key>+<value>]*
//! ```

pub mod abi;
pub mod arch;
pub mod os;
pub mod paths;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use abi::{AbiAxis, CxxStringAbi, GfortranVersion, expand, expand_cxxstring_abis, expand_gfortran_versions};
pub use arch::Arch;
pub use os::{CallAbi, Libc, Os};

/// Errors produced while parsing or constructing platforms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
  #[error("invalid triplet '{triplet}': {reason}")]
  InvalidTriplet { triplet: String, reason: String },

  #[error("invalid platform tag '{key}+{value}'")]
  InvalidTag { key: String, value: String },
}

fn invalid(triplet: &str, reason: impl Into<String>) -> PlatformError {
  PlatformError::InvalidTriplet {
    triplet: triplet.to_string(),
    reason: reason.into(),
  }
}

/// A concrete build target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
  pub arch: Arch,
  pub os: Os,
  pub libc: Option<Libc>,
  pub call_abi: Option<CallAbi>,
  pub libgfortran_version: Option<GfortranVersion>,
  pub cxxstring_abi: Option<CxxStringAbi>,
  pub tags: BTreeMap<String, String>,
}

/// A build target, or the sentinel that matches every target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Platform {
  Any,
  Concrete(Target),
}

impl Platform {
  /// Create a platform with the default libc and call ABI for `os`/`arch`.
  pub fn new(arch: Arch, os: Os) -> Self {
    let libc = (os == Os::Linux).then_some(Libc::Glibc);
    let call_abi = (os == Os::Linux && arch.is_arm32()).then_some(CallAbi::EabiHf);
    Platform::Concrete(Target {
      arch,
      os,
      libc,
      call_abi,
      libgfortran_version: None,
      cxxstring_abi: None,
      tags: BTreeMap::new(),
    })
  }

  /// Parse a triplet string. `"any"` yields [`Platform::Any`].
  pub fn parse(triplet: &str) -> Result<Self, PlatformError> {
    parse_triplet(triplet)
  }

  /// Detect the platform of the running process.
  ///
  /// Returns `None` if the OS or architecture is not supported.
  pub fn host() -> Option<Self> {
    let platform = Platform::new(Arch::current()?, Os::current()?);
    match (&platform, Libc::current()) {
      (Platform::Concrete(t), Some(libc)) if t.os == Os::Linux => Some(platform.with_libc(libc)),
      _ => Some(platform),
    }
  }

  pub fn with_libc(self, libc: Libc) -> Self {
    self.map_target(|t| {
      if t.os == Os::Linux {
        t.libc = Some(libc);
      }
    })
  }

  pub fn with_libgfortran_version(self, version: GfortranVersion) -> Self {
    self.map_target(|t| t.libgfortran_version = Some(version))
  }

  pub fn with_cxxstring_abi(self, abi: CxxStringAbi) -> Self {
    self.map_target(|t| t.cxxstring_abi = Some(abi))
  }

  /// Attach a free-form `key+value` tag.
  pub fn with_tag(self, key: &str, value: &str) -> Result<Self, PlatformError> {
    if !valid_tag_key(key) || !valid_tag_value(value) {
      return Err(PlatformError::InvalidTag {
        key: key.to_string(),
        value: value.to_string(),
      });
    }
    Ok(self.map_target(|t| {
      t.tags.insert(key.to_string(), value.to_string());
    }))
  }

  fn map_target(self, f: impl FnOnce(&mut Target)) -> Self {
    match self {
      Platform::Any => Platform::Any,
      Platform::Concrete(mut t) => {
        f(&mut t);
        Platform::Concrete(t)
      }
    }
  }

  pub fn is_any(&self) -> bool {
    matches!(self, Platform::Any)
  }

  pub fn target(&self) -> Option<&Target> {
    match self {
      Platform::Any => None,
      Platform::Concrete(t) => Some(t),
    }
  }

  pub fn arch(&self) -> Option<Arch> {
    self.target().map(|t| t.arch)
  }

  pub fn os(&self) -> Option<Os> {
    self.target().map(|t| t.os)
  }

  pub fn libgfortran_version(&self) -> Option<GfortranVersion> {
    self.target().and_then(|t| t.libgfortran_version)
  }

  pub fn cxxstring_abi(&self) -> Option<CxxStringAbi> {
    self.target().and_then(|t| t.cxxstring_abi)
  }

  pub fn is_windows(&self) -> bool {
    self.os() == Some(Os::Windows)
  }

  pub fn is_apple(&self) -> bool {
    self.os() == Some(Os::MacOs)
  }

  pub fn is_unix(&self) -> bool {
    matches!(self.os(), Some(Os::Linux | Os::MacOs | Os::FreeBsd))
  }

  /// Suffix appended to executable names (`.exe` on Windows).
  pub fn exe_suffix(&self) -> &'static str {
    if self.is_windows() { ".exe" } else { "" }
  }

  /// Shared library extension without the dot.
  pub fn dlext(&self) -> &'static str {
    match self.os() {
      Some(Os::Windows) => "dll",
      Some(Os::MacOs) => "dylib",
      _ => "so",
    }
  }

  /// Prefix-relative directories that hold shared libraries.
  pub fn library_dirs(&self) -> &'static [&'static str] {
    if self.is_windows() { &["bin"] } else { &["lib", "lib64"] }
  }

  /// The canonical triplet string (e.g. `x86_64-linux-gnu-cxx11`).
  pub fn triplet(&self) -> String {
    let Platform::Concrete(t) = self else {
      return "any".to_string();
    };

    let mut out = format!("{}-{}", t.arch, os_part(t));
    if let Some(v) = t.libgfortran_version {
      out.push('-');
      out.push_str(&v.to_string());
    }
    if let Some(abi) = t.cxxstring_abi {
      out.push('-');
      out.push_str(abi.as_str());
    }
    for (key, value) in &t.tags {
      out.push_str(&format!("-{}+{}", key, value));
    }
    out
  }

  /// Whether two platform descriptions can stand in for each other.
  ///
  /// Required fields must match exactly; optional sub-versions must match
  /// unless one side leaves them unconstrained; tags must agree on shared keys.
  pub fn is_compatible(&self, other: &Platform) -> bool {
    let (Platform::Concrete(a), Platform::Concrete(b)) = (self, other) else {
      return true;
    };

    fn loose<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
      match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
      }
    }

    a.arch == b.arch
      && a.os == b.os
      && a.libc == b.libc
      && a.call_abi == b.call_abi
      && loose(&a.libgfortran_version, &b.libgfortran_version)
      && loose(&a.cxxstring_abi, &b.cxxstring_abi)
      && a.tags.iter().all(|(k, v)| b.tags.get(k).is_none_or(|bv| bv == v))
  }

  /// Whether binaries built for `other` run natively on `self`.
  pub fn can_execute(&self, other: &Platform) -> bool {
    let (Platform::Concrete(host), Platform::Concrete(guest)) = (self, other) else {
      return false;
    };
    let arch_ok = host.arch == guest.arch || (host.arch == Arch::X86_64 && guest.arch == Arch::I686);
    arch_ok && host.os == guest.os && (guest.libc.is_none() || host.libc == guest.libc)
  }
}

fn os_part(t: &Target) -> String {
  match t.os {
    Os::Linux => {
      let libc = t.libc.unwrap_or(Libc::Glibc);
      match t.call_abi {
        Some(abi) => format!("linux-{}{}", libc, abi),
        None => format!("linux-{}", libc),
      }
    }
    Os::MacOs => "apple-darwin".to_string(),
    Os::Windows => "w64-mingw32".to_string(),
    Os::FreeBsd => "unknown-freebsd".to_string(),
  }
}

fn valid_tag_key(key: &str) -> bool {
  !key.is_empty()
    && key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    && !key.starts_with("libgfortran")
    && CxxStringAbi::parse(key).is_none()
}

fn valid_tag_value(value: &str) -> bool {
  !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Strip a trailing OS version (`darwin14`, `freebsd11.1`) from a token.
fn strip_version<'a>(token: &'a str, name: &str) -> Option<&'a str> {
  let rest = token.strip_prefix(name)?;
  rest.chars().all(|c| c.is_ascii_digit() || c == '.').then_some(rest)
}

fn parse_triplet(triplet: &str) -> Result<Platform, PlatformError> {
  if triplet == "any" {
    return Ok(Platform::Any);
  }

  let mut tokens = triplet.split('-').peekable();
  let arch_token = tokens.next().unwrap_or_default();
  let arch = Arch::parse(arch_token).ok_or_else(|| invalid(triplet, format!("unknown architecture '{}'", arch_token)))?;

  // Vendor fields carry no information beyond what the OS token implies.
  while matches!(tokens.peek(), Some(&("unknown" | "pc" | "apple" | "w64"))) {
    tokens.next();
  }

  let os_token = tokens.next().ok_or_else(|| invalid(triplet, "missing operating system"))?;
  let (os, libc, call_abi) = match os_token {
    "linux" => {
      let libc_token = tokens.next().ok_or_else(|| invalid(triplet, "missing libc"))?;
      let (libc, abi_suffix) = if let Some(rest) = libc_token.strip_prefix("gnu") {
        (Libc::Glibc, rest)
      } else if let Some(rest) = libc_token.strip_prefix("musl") {
        (Libc::Musl, rest)
      } else {
        return Err(invalid(triplet, format!("unknown libc '{}'", libc_token)));
      };
      let call_abi = match abi_suffix {
        "" if arch.is_arm32() => Some(CallAbi::EabiHf),
        "" => None,
        "eabihf" if arch.is_arm32() => Some(CallAbi::EabiHf),
        other => return Err(invalid(triplet, format!("unsupported call ABI '{}' for {}", other, arch))),
      };
      (Os::Linux, Some(libc), call_abi)
    }
    "mingw32" | "windows" => (Os::Windows, None, None),
    token if strip_version(token, "darwin").is_some() || strip_version(token, "macos").is_some() => {
      (Os::MacOs, None, None)
    }
    token if strip_version(token, "freebsd").is_some() => (Os::FreeBsd, None, None),
    other => return Err(invalid(triplet, format!("unknown operating system '{}'", other))),
  };

  check_supported(triplet, arch, os)?;

  let mut target = Target {
    arch,
    os,
    libc,
    call_abi,
    libgfortran_version: None,
    cxxstring_abi: None,
    tags: BTreeMap::new(),
  };

  for token in tokens {
    if let Some(version) = GfortranVersion::parse(token) {
      if target.libgfortran_version.replace(version).is_some() {
        return Err(invalid(triplet, "libgfortran version given twice"));
      }
    } else if let Some(abi) = CxxStringAbi::parse(token) {
      if target.cxxstring_abi.replace(abi).is_some() {
        return Err(invalid(triplet, "C++ string ABI given twice"));
      }
    } else if let Some((key, value)) = token.split_once('+') {
      if !valid_tag_key(key) || !valid_tag_value(value) {
        return Err(invalid(triplet, format!("malformed tag '{}'", token)));
      }
      if target.tags.insert(key.to_string(), value.to_string()).is_some() {
        return Err(invalid(triplet, format!("tag '{}' given twice", key)));
      }
    } else {
      return Err(invalid(triplet, format!("unrecognized token '{}'", token)));
    }
  }

  Ok(Platform::Concrete(target))
}

fn check_supported(triplet: &str, arch: Arch, os: Os) -> Result<(), PlatformError> {
  let ok = match os {
    Os::Linux => true,
    Os::MacOs | Os::FreeBsd => matches!(arch, Arch::X86_64 | Arch::Aarch64),
    Os::Windows => matches!(arch, Arch::I686 | Arch::X86_64),
  };
  if ok {
    Ok(())
  } else {
    Err(invalid(triplet, format!("{} is not supported on {}", arch, os)))
  }
}

/// Every concrete platform with a known toolchain layout.
pub fn supported_platforms() -> Vec<Platform> {
  let mut platforms = Vec::new();
  for libc in [Libc::Glibc, Libc::Musl] {
    for arch in Arch::ALL {
      platforms.push(Platform::new(arch, Os::Linux).with_libc(libc));
    }
  }
  for arch in [Arch::X86_64, Arch::Aarch64] {
    platforms.push(Platform::new(arch, Os::MacOs));
    platforms.push(Platform::new(arch, Os::FreeBsd));
  }
  for arch in [Arch::I686, Arch::X86_64] {
    platforms.push(Platform::new(arch, Os::Windows));
  }
  platforms
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triplet())
  }
}

impl FromStr for Platform {
  type Err = PlatformError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse_triplet(s)
  }
}

impl Serialize for Platform {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.triplet())
  }
}

impl<'de> Deserialize<'de> for Platform {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_triplet(&s).map_err(serde::de::Error::custom)
  }
}
