use std::path::Path;

use goblin::pe::PE;
use goblin::pe::header;

use super::{BinaryFormat, BinaryInfo, FormatKind, RewritePlan, detect_cxx_abi};
use crate::audit::AuditError;
use crate::audit::policy::AuditPolicy;
use crate::platform::Arch;

pub struct PeFormat;

fn arch_of(machine: u16) -> Option<Arch> {
  match machine {
    header::COFF_MACHINE_X86_64 => Some(Arch::X86_64),
    header::COFF_MACHINE_X86 => Some(Arch::I686),
    header::COFF_MACHINE_ARM64 => Some(Arch::Aarch64),
    header::COFF_MACHINE_ARMNT => Some(Arch::Armv7l),
    _ => None,
  }
}

impl BinaryFormat for PeFormat {
  fn kind(&self) -> FormatKind {
    FormatKind::Pe
  }

  fn inspect(&self, bytes: &[u8]) -> Result<BinaryInfo, AuditError> {
    let pe = PE::parse(bytes).map_err(|e| AuditError::Parse(format!("malformed PE: {}", e)))?;
    let machine = pe.header.coff_header.machine;

    Ok(BinaryInfo {
      kind: FormatKind::Pe,
      arch: arch_of(machine),
      machine: machine as u32,
      libraries: pe.libraries.iter().map(|l| l.to_string()).collect(),
      search_paths: Vec::new(),
      soname: pe.name.map(String::from),
      cxx_string_abi: detect_cxx_abi(bytes),
    })
  }

  /// DLLs are found next to the executable or on `PATH`.
  fn origin(&self) -> Option<&'static str> {
    None
  }

  fn rewrite_search_paths(
    &self,
    _path: &Path,
    _info: &BinaryInfo,
    _plan: &RewritePlan,
    _policy: &AuditPolicy,
  ) -> Result<(), AuditError> {
    Ok(())
  }
}
