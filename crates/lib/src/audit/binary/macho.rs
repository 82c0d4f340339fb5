use std::ffi::OsString;
use std::path::Path;

use goblin::mach::Mach;
use goblin::mach::cputype;

use super::{BinaryFormat, BinaryInfo, FormatKind, RewritePlan, detect_cxx_abi, run_tool};
use crate::audit::AuditError;
use crate::audit::policy::AuditPolicy;
use crate::platform::Arch;

pub struct MachOFormat;

fn arch_of(cpu: u32) -> Option<Arch> {
  match cpu {
    cputype::CPU_TYPE_X86_64 => Some(Arch::X86_64),
    cputype::CPU_TYPE_ARM64 => Some(Arch::Aarch64),
    cputype::CPU_TYPE_X86 => Some(Arch::I686),
    _ => None,
  }
}

impl BinaryFormat for MachOFormat {
  fn kind(&self) -> FormatKind {
    FormatKind::MachO
  }

  fn inspect(&self, bytes: &[u8]) -> Result<BinaryInfo, AuditError> {
    let macho = match Mach::parse(bytes) {
      Ok(Mach::Binary(macho)) => macho,
      Ok(Mach::Fat(_)) => {
        return Err(AuditError::Parse(
          "universal Mach-O binaries are not supported; build one architecture per platform".to_string(),
        ));
      }
      Err(e) => return Err(AuditError::Parse(format!("malformed Mach-O: {}", e))),
    };

    // Mangled names live in the string table.
    let cxx_string_abi = detect_cxx_abi(bytes);

    Ok(BinaryInfo {
      kind: FormatKind::MachO,
      arch: arch_of(macho.header.cputype),
      machine: macho.header.cputype,
      // goblin lists the image itself first.
      libraries: macho.libs.iter().filter(|l| **l != "self").map(|l| l.to_string()).collect(),
      search_paths: macho.rpaths.iter().map(|p| p.to_string()).collect(),
      soname: macho.name.map(String::from),
      cxx_string_abi,
    })
  }

  fn origin(&self) -> Option<&'static str> {
    Some("@loader_path")
  }

  fn rewrite_search_paths(
    &self,
    path: &Path,
    info: &BinaryInfo,
    plan: &RewritePlan,
    policy: &AuditPolicy,
  ) -> Result<(), AuditError> {
    let mut args: Vec<OsString> = Vec::new();

    for old in info.search_paths.iter().filter(|p| !plan.search_paths.contains(p)) {
      args.push("-delete_rpath".into());
      args.push(old.into());
    }
    for new in plan.search_paths.iter().filter(|p| !info.search_paths.contains(p)) {
      args.push("-add_rpath".into());
      args.push(new.into());
    }
    for (old, new) in &plan.renamed_libraries {
      args.push("-change".into());
      args.push(old.into());
      args.push(new.into());
    }
    if let Some(id) = &plan.install_name {
      args.push("-id".into());
      args.push(id.into());
    }

    if args.is_empty() {
      return Ok(());
    }
    args.push(path.as_os_str().to_os_string());
    run_tool(&policy.install_name_tool, &args)
  }
}
