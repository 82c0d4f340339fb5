//! Object file formats understood by the audit.

mod elf;
mod macho;
mod pe;

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Command;

use tracing::debug;

pub use elf::ElfFormat;
pub use macho::MachOFormat;
pub use pe::PeFormat;

use super::AuditError;
use super::policy::AuditPolicy;
use crate::platform::{Arch, CxxStringAbi, Os};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
  Elf,
  MachO,
  Pe,
}

impl FormatKind {
  /// The format executables of `os` use.
  pub fn native_to(os: Os) -> FormatKind {
    match os {
      Os::Windows => FormatKind::Pe,
      Os::MacOs => FormatKind::MachO,
      Os::Linux | Os::FreeBsd => FormatKind::Elf,
    }
  }
}

impl fmt::Display for FormatKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FormatKind::Elf => "ELF",
      FormatKind::MachO => "Mach-O",
      FormatKind::Pe => "PE",
    };
    write!(f, "{}", s)
  }
}

/// What the audit needs to know about one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
  pub kind: FormatKind,
  /// `None` when the machine type is not one we build for.
  pub arch: Option<Arch>,
  /// Raw machine identifier, for messages.
  pub machine: u32,
  /// Required libraries as recorded in the binary.
  pub libraries: Vec<String>,
  /// RUNPATH/RPATH entries (ELF) or LC_RPATH entries (Mach-O).
  pub search_paths: Vec<String>,
  /// SONAME (ELF) or install name (Mach-O).
  pub soname: Option<String>,
  pub cxx_string_abi: Option<CxxStringAbi>,
}

impl BinaryInfo {
  /// Whether the binary's machine runs code built for `arch`.
  pub fn matches_arch(&self, arch: Arch) -> bool {
    match self.arch {
      Some(own) => own == arch || (own.is_arm32() && arch.is_arm32()),
      None => false,
    }
  }
}

/// Changes that make a binary relocatable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewritePlan {
  /// Complete replacement list of search paths.
  pub search_paths: Vec<String>,
  /// `(old, new)` library references.
  pub renamed_libraries: Vec<(String, String)>,
  pub install_name: Option<String>,
}

/// A binary format the audit can inspect and rewrite.
pub trait BinaryFormat: Send + Sync {
  fn kind(&self) -> FormatKind;

  fn inspect(&self, bytes: &[u8]) -> Result<BinaryInfo, AuditError>;

  fn linked_libraries(&self, bytes: &[u8]) -> Result<Vec<String>, AuditError> {
    Ok(self.inspect(bytes)?.libraries)
  }

  /// Token that resolves to the loading binary's directory, if the format
  /// has one.
  fn origin(&self) -> Option<&'static str>;

  /// Apply `plan` to the file at `path`.
  fn rewrite_search_paths(
    &self,
    path: &Path,
    info: &BinaryInfo,
    plan: &RewritePlan,
    policy: &AuditPolicy,
  ) -> Result<(), AuditError>;
}

const ELF_MAGIC: &[u8] = b"\x7fELF";
const MACHO_MAGICS: [u32; 4] = [0xfeed_face, 0xfeed_facf, 0xcefa_edfe, 0xcffa_edfe];
const FAT_MAGIC: u32 = 0xcafe_babe;

/// Select the format of `bytes` by signature.
pub fn detect_format(bytes: &[u8]) -> Option<&'static dyn BinaryFormat> {
  if bytes.starts_with(ELF_MAGIC) {
    return Some(&ElfFormat);
  }

  if bytes.len() >= 8 {
    let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if MACHO_MAGICS.contains(&magic) {
      return Some(&MachOFormat);
    }
    // Java class files share the fat magic; their version field is >= 45.
    let count = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if magic == FAT_MAGIC && count > 0 && count < 45 {
      return Some(&MachOFormat);
    }
  }

  if bytes.starts_with(b"MZ") && bytes.len() >= 0x40 {
    let pe_offset = u32::from_le_bytes([bytes[0x3c], bytes[0x3d], bytes[0x3e], bytes[0x3f]]) as usize;
    if bytes.get(pe_offset..pe_offset + 4) == Some(b"PE\0\0".as_slice()) {
      return Some(&PeFormat);
    }
  }

  None
}

/// Leading bytes [`has_signature`] looks at.
pub const SIGNATURE_LEN: usize = 8;

/// Cheap pre-filter: whether a file starting with `prefix` may be a binary.
pub fn has_signature(prefix: &[u8]) -> bool {
  if prefix.starts_with(ELF_MAGIC) || prefix.starts_with(b"MZ") {
    return true;
  }
  prefix.len() >= 4 && {
    let magic = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    MACHO_MAGICS.contains(&magic) || magic == FAT_MAGIC
  }
}

/// Run an external rewriting tool to completion.
pub(crate) fn run_tool(tool: &Path, args: &[OsString]) -> Result<(), AuditError> {
  debug!(tool = %tool.display(), ?args, "running rewrite tool");
  let output = Command::new(tool).args(args).output().map_err(|source| AuditError::Tool {
    tool: tool.display().to_string(),
    source,
  })?;

  if output.status.success() {
    Ok(())
  } else {
    Err(AuditError::ToolFailed {
      tool: tool.display().to_string(),
      message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
  }
}

/// Whether `haystack` contains `needle`.
fn contains(haystack: &[u8], needle: &[u8]) -> bool {
  haystack.windows(needle.len()).any(|w| w == needle)
}

/// C++ string ABI evidenced by mangled names in a string table.
pub(crate) fn detect_cxx_abi(strings: &[u8]) -> Option<CxxStringAbi> {
  if contains(strings, b"__cxx11") {
    Some(CxxStringAbi::Cxx11)
  } else if contains(strings, b"_ZNSs") || contains(strings, b"_ZNKSs") {
    Some(CxxStringAbi::Cxx03)
  } else {
    None
  }
}
