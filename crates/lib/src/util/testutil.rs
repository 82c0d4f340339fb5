//! Test utilities for crossbake-lib.
//!
//! Hand-assembled ELF and Mach-O images let the audit engine be exercised
//! without a cross toolchain on the test host.

use std::path::Path;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_RUNPATH: u64 = 29;

/// Builder for a minimal little-endian ELF64 image with a dynamic section.
#[derive(Debug, Clone)]
pub struct ElfFixture {
  pub machine: u16,
  pub shared_object: bool,
  pub needed: Vec<String>,
  pub runpath: Option<String>,
  pub soname: Option<String>,
  /// Additional strings placed in `.dynstr`, e.g. mangled symbol names.
  pub symbols: Vec<String>,
}

impl ElfFixture {
  pub fn executable(machine: u16) -> Self {
    Self {
      machine,
      shared_object: false,
      needed: Vec::new(),
      runpath: None,
      soname: None,
      symbols: Vec::new(),
    }
  }

  pub fn library(machine: u16, soname: &str) -> Self {
    Self {
      shared_object: true,
      soname: Some(soname.to_string()),
      ..Self::executable(machine)
    }
  }

  pub fn needs(mut self, lib: &str) -> Self {
    self.needed.push(lib.to_string());
    self
  }

  pub fn runpath(mut self, runpath: &str) -> Self {
    self.runpath = Some(runpath.to_string());
    self
  }

  pub fn symbol(mut self, name: &str) -> Self {
    self.symbols.push(name.to_string());
    self
  }

  pub fn build(&self) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    let dynstr_off = EHDR + 2 * PHDR;

    let mut dynstr = vec![0u8];
    let add_str = |s: &str, table: &mut Vec<u8>| -> u64 {
      let at = table.len() as u64;
      table.extend_from_slice(s.as_bytes());
      table.push(0);
      at
    };

    let mut dyns: Vec<(u64, u64)> = Vec::new();
    for lib in &self.needed {
      let at = add_str(lib, &mut dynstr);
      dyns.push((DT_NEEDED, at));
    }
    if let Some(soname) = &self.soname {
      let at = add_str(soname, &mut dynstr);
      dyns.push((DT_SONAME, at));
    }
    if let Some(runpath) = &self.runpath {
      let at = add_str(runpath, &mut dynstr);
      dyns.push((DT_RUNPATH, at));
    }
    for sym in &self.symbols {
      add_str(sym, &mut dynstr);
    }
    while dynstr.len() % 8 != 0 {
      dynstr.push(0);
    }

    let dynamic_off = dynstr_off + dynstr.len();
    dyns.push((DT_STRTAB, dynstr_off as u64));
    dyns.push((DT_STRSZ, dynstr.len() as u64));
    dyns.push((DT_NULL, 0));
    let dynamic_len = dyns.len() * 16;
    let total = dynamic_off + dynamic_len;

    let mut out = Vec::with_capacity(total);
    // e_ident
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&(if self.shared_object { 3u16 } else { 2u16 }).to_le_bytes());
    out.extend_from_slice(&self.machine.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&(EHDR as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR as u16).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    let phdr = |p_type: u32, flags: u32, offset: u64, size: u64, align: u64, out: &mut Vec<u8>| {
      out.extend_from_slice(&p_type.to_le_bytes());
      out.extend_from_slice(&flags.to_le_bytes());
      out.extend_from_slice(&offset.to_le_bytes()); // p_offset
      out.extend_from_slice(&offset.to_le_bytes()); // p_vaddr
      out.extend_from_slice(&offset.to_le_bytes()); // p_paddr
      out.extend_from_slice(&size.to_le_bytes()); // p_filesz
      out.extend_from_slice(&size.to_le_bytes()); // p_memsz
      out.extend_from_slice(&align.to_le_bytes());
    };
    phdr(1, 5, 0, total as u64, 0x1000, &mut out); // PT_LOAD
    phdr(2, 6, dynamic_off as u64, dynamic_len as u64, 8, &mut out); // PT_DYNAMIC

    out.extend_from_slice(&dynstr);
    for (tag, val) in dyns {
      out.extend_from_slice(&tag.to_le_bytes());
      out.extend_from_slice(&val.to_le_bytes());
    }
    out
  }

  pub fn write_to(&self, path: &Path) {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, self.build()).unwrap();
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
  }
}

pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;
pub const CPU_TYPE_ARM64: u32 = 0x0100_000c;

/// Builder for a minimal 64-bit Mach-O image with dylib and rpath load commands.
#[derive(Debug, Clone)]
pub struct MachOFixture {
  pub cputype: u32,
  pub install_name: Option<String>,
  pub dylibs: Vec<String>,
  pub rpaths: Vec<String>,
}

impl MachOFixture {
  pub fn executable(cputype: u32) -> Self {
    Self {
      cputype,
      install_name: None,
      dylibs: Vec::new(),
      rpaths: Vec::new(),
    }
  }

  pub fn links(mut self, dylib: &str) -> Self {
    self.dylibs.push(dylib.to_string());
    self
  }

  pub fn rpath(mut self, rpath: &str) -> Self {
    self.rpaths.push(rpath.to_string());
    self
  }

  fn padded(s: &str, header: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while (header + bytes.len()) % 8 != 0 {
      bytes.push(0);
    }
    bytes
  }

  pub fn build(&self) -> Vec<u8> {
    const LC_LOAD_DYLIB: u32 = 0xc;
    const LC_ID_DYLIB: u32 = 0xd;
    const LC_RPATH: u32 = 0x8000_001c;

    let mut cmds: Vec<u8> = Vec::new();
    let mut ncmds = 0u32;

    let dylib_cmd = |cmd: u32, name: &str, cmds: &mut Vec<u8>| {
      let name = Self::padded(name, 24);
      cmds.extend_from_slice(&cmd.to_le_bytes());
      cmds.extend_from_slice(&((24 + name.len()) as u32).to_le_bytes());
      cmds.extend_from_slice(&24u32.to_le_bytes()); // name offset
      cmds.extend_from_slice(&2u32.to_le_bytes()); // timestamp
      cmds.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // current_version
      cmds.extend_from_slice(&0x0001_0000u32.to_le_bytes()); // compatibility_version
      cmds.extend_from_slice(&name);
    };

    if let Some(id) = &self.install_name {
      dylib_cmd(LC_ID_DYLIB, id, &mut cmds);
      ncmds += 1;
    }
    for lib in &self.dylibs {
      dylib_cmd(LC_LOAD_DYLIB, lib, &mut cmds);
      ncmds += 1;
    }
    for rpath in &self.rpaths {
      let path = Self::padded(rpath, 12);
      cmds.extend_from_slice(&LC_RPATH.to_le_bytes());
      cmds.extend_from_slice(&((12 + path.len()) as u32).to_le_bytes());
      cmds.extend_from_slice(&12u32.to_le_bytes());
      cmds.extend_from_slice(&path);
      ncmds += 1;
    }

    let filetype: u32 = if self.install_name.is_some() { 6 } else { 2 };
    let mut out = Vec::new();
    out.extend_from_slice(&0xfeed_facfu32.to_le_bytes());
    out.extend_from_slice(&self.cputype.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
    out.extend_from_slice(&filetype.to_le_bytes());
    out.extend_from_slice(&ncmds.to_le_bytes());
    out.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&0u32.to_le_bytes()); // reserved
    out.extend_from_slice(&cmds);
    out
  }

  pub fn write_to(&self, path: &Path) {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, self.build()).unwrap();
  }
}

/// Write a file (creating parents) relative to `root`.
pub fn write_file(root: &Path, relative: &str, content: &[u8]) {
  let path = root.join(relative);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}

/// Build a gzip-compressed tarball from `(path, content)` pairs.
pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
  let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (path, content) in entries {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, *content).unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap()
}
