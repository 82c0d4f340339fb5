use std::ffi::OsString;
use std::fs;
use std::ops::Range;
use std::path::Path;

use goblin::elf::Elf;
use goblin::elf::dynamic::{DT_RPATH, DT_RUNPATH};
use goblin::elf::header;
use goblin::elf::program_header::PT_LOAD;
use tracing::debug;

use super::{BinaryFormat, BinaryInfo, FormatKind, RewritePlan, detect_cxx_abi, run_tool};
use crate::audit::AuditError;
use crate::audit::policy::AuditPolicy;
use crate::platform::Arch;

pub struct ElfFormat;

/// Every supported architecture is little-endian; a big-endian object is
/// never a match, whatever its machine.
fn arch_of(machine: u16, little_endian: bool) -> Option<Arch> {
  if !little_endian {
    return None;
  }
  match machine {
    header::EM_X86_64 => Some(Arch::X86_64),
    header::EM_386 => Some(Arch::I686),
    header::EM_AARCH64 => Some(Arch::Aarch64),
    header::EM_ARM => Some(Arch::Armv7l),
    header::EM_PPC64 => Some(Arch::Powerpc64le),
    header::EM_RISCV => Some(Arch::Riscv64),
    _ => None,
  }
}

/// File offset of virtual address `vaddr`.
fn file_offset(elf: &Elf<'_>, vaddr: u64) -> Option<u64> {
  elf
    .program_headers
    .iter()
    .filter(|ph| ph.p_type == PT_LOAD)
    .find(|ph| vaddr >= ph.p_vaddr && vaddr < ph.p_vaddr + ph.p_filesz)
    .map(|ph| ph.p_offset + (vaddr - ph.p_vaddr))
}

/// File range of the dynamic string table.
fn dynstr_range(elf: &Elf<'_>, len: usize) -> Option<Range<usize>> {
  let dynamic = elf.dynamic.as_ref()?;
  let start = file_offset(elf, dynamic.info.strtab as u64)? as usize;
  let end = start.checked_add(dynamic.info.strsz)?;
  (end <= len).then_some(start..end)
}

fn parse(bytes: &[u8]) -> Result<Elf<'_>, AuditError> {
  Elf::parse(bytes).map_err(|e| AuditError::Parse(format!("malformed ELF: {}", e)))
}

/// Overwrite the existing RUNPATH (or RPATH) string with `value` when it
/// fits. Returns `false` when it does not.
fn rewrite_in_place(bytes: &mut [u8], value: &str) -> Result<bool, AuditError> {
  let (start, end) = {
    let elf = parse(bytes)?;
    let Some(strings) = dynstr_range(&elf, bytes.len()) else {
      return Ok(false);
    };
    let Some(dynamic) = elf.dynamic.as_ref() else {
      return Ok(false);
    };
    let entry = dynamic
      .dyns
      .iter()
      .find(|d| d.d_tag == DT_RUNPATH)
      .or_else(|| dynamic.dyns.iter().find(|d| d.d_tag == DT_RPATH));
    let Some(entry) = entry else {
      return Ok(false);
    };

    let start = strings.start + entry.d_val as usize;
    if start >= strings.end {
      return Err(AuditError::Parse("search path string outside .dynstr".to_string()));
    }
    let len = bytes[start..strings.end].iter().position(|&b| b == 0).unwrap_or(strings.end - start);
    (start, start + len)
  };

  if value.len() > end - start {
    return Ok(false);
  }
  bytes[start..end].fill(0);
  bytes[start..start + value.len()].copy_from_slice(value.as_bytes());
  Ok(true)
}

impl BinaryFormat for ElfFormat {
  fn kind(&self) -> FormatKind {
    FormatKind::Elf
  }

  fn inspect(&self, bytes: &[u8]) -> Result<BinaryInfo, AuditError> {
    let elf = parse(bytes)?;

    let raw_paths = if elf.runpaths.is_empty() { &elf.rpaths } else { &elf.runpaths };
    let search_paths = raw_paths
      .iter()
      .flat_map(|p| p.split(':'))
      .filter(|p| !p.is_empty())
      .map(String::from)
      .collect();

    let cxx_string_abi = dynstr_range(&elf, bytes.len()).and_then(|r| detect_cxx_abi(&bytes[r]));

    Ok(BinaryInfo {
      kind: FormatKind::Elf,
      arch: arch_of(elf.header.e_machine, elf.little_endian),
      machine: elf.header.e_machine as u32,
      libraries: elf.libraries.iter().map(|l| l.to_string()).collect(),
      search_paths,
      soname: elf.soname.map(String::from),
      cxx_string_abi,
    })
  }

  fn origin(&self) -> Option<&'static str> {
    Some("$ORIGIN")
  }

  fn rewrite_search_paths(
    &self,
    path: &Path,
    _info: &BinaryInfo,
    plan: &RewritePlan,
    policy: &AuditPolicy,
  ) -> Result<(), AuditError> {
    let value = plan.search_paths.join(":");
    let mut bytes = fs::read(path)?;

    if rewrite_in_place(&mut bytes, &value)? {
      fs::write(path, &bytes)?;
      debug!(path = %path.display(), runpath = %value, "rewrote runpath in place");
      return Ok(());
    }

    run_tool(
      &policy.patchelf,
      &[
        OsString::from("--set-rpath"),
        OsString::from(&value),
        path.as_os_str().to_os_string(),
      ],
    )
  }
}
