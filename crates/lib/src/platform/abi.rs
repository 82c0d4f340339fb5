//! ABI-affecting sub-versions and the axes used to expand a platform list.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Os, Platform};

/// Major version of the Fortran runtime (`libgfortran.so.N`) a binary links against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GfortranVersion(pub u8);

impl GfortranVersion {
  pub const ALL: [GfortranVersion; 3] = [GfortranVersion(3), GfortranVersion(4), GfortranVersion(5)];

  pub fn parse(token: &str) -> Option<Self> {
    let n: u8 = token.strip_prefix("libgfortran")?.parse().ok()?;
    Self::ALL.contains(&GfortranVersion(n)).then_some(GfortranVersion(n))
  }
}

impl fmt::Display for GfortranVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "libgfortran{}", self.0)
  }
}

/// Which `std::string` ABI the C++ runtime exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CxxStringAbi {
  Cxx03,
  Cxx11,
}

impl CxxStringAbi {
  pub const ALL: [CxxStringAbi; 2] = [CxxStringAbi::Cxx03, CxxStringAbi::Cxx11];

  pub fn parse(token: &str) -> Option<Self> {
    match token {
      "cxx03" => Some(Self::Cxx03),
      "cxx11" => Some(Self::Cxx11),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cxx03 => "cxx03",
      Self::Cxx11 => "cxx11",
    }
  }
}

impl fmt::Display for CxxStringAbi {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// An ABI axis along which a package may need independent builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbiAxis {
  LibgfortranVersions,
  CxxStringAbis,
}

/// Enumerate the shards of `base` along `axis`.
///
/// Platforms that already constrain the axis, or where the axis does not
/// apply, come back unchanged as a single-element list.
pub fn expand(base: &Platform, axis: AbiAxis) -> Vec<Platform> {
  let Platform::Concrete(target) = base else {
    return vec![base.clone()];
  };

  match axis {
    AbiAxis::LibgfortranVersions => {
      if target.libgfortran_version.is_some() {
        return vec![base.clone()];
      }
      GfortranVersion::ALL
        .iter()
        .map(|v| base.clone().with_libgfortran_version(*v))
        .collect()
    }
    AbiAxis::CxxStringAbis => {
      // libc++ based platforms only ship one string ABI.
      if target.cxxstring_abi.is_some() || matches!(target.os, Os::MacOs | Os::FreeBsd) {
        return vec![base.clone()];
      }
      CxxStringAbi::ALL
        .iter()
        .map(|abi| base.clone().with_cxxstring_abi(*abi))
        .collect()
    }
  }
}

/// Expand every platform in `platforms` across libgfortran versions.
pub fn expand_gfortran_versions(platforms: &[Platform]) -> Vec<Platform> {
  platforms
    .iter()
    .flat_map(|p| expand(p, AbiAxis::LibgfortranVersions))
    .collect()
}

/// Expand every platform in `platforms` across C++ string ABIs.
pub fn expand_cxxstring_abis(platforms: &[Platform]) -> Vec<Platform> {
  platforms
    .iter()
    .flat_map(|p| expand(p, AbiAxis::CxxStringAbis))
    .collect()
}
