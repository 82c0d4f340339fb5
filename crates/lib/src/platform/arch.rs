use std::fmt;

/// CPU architecture variants a build can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
  I686,
  X86_64,
  Aarch64,
  Armv6l,
  Armv7l,
  Powerpc64le,
  Riscv64,
}

impl Arch {
  pub const ALL: [Arch; 7] = [
    Arch::I686,
    Arch::X86_64,
    Arch::Aarch64,
    Arch::Armv6l,
    Arch::Armv7l,
    Arch::Powerpc64le,
    Arch::Riscv64,
  ];

  /// Detect the current CPU architecture at runtime
  pub fn current() -> Option<Self> {
    match std::env::consts::ARCH {
      "x86" => Some(Self::I686),
      "x86_64" => Some(Self::X86_64),
      "aarch64" => Some(Self::Aarch64),
      "arm" => Some(Self::Armv7l),
      "powerpc64" => Some(Self::Powerpc64le),
      "riscv64" => Some(Self::Riscv64),
      _ => None,
    }
  }

  /// Parse an architecture token, accepting the usual aliases.
  pub fn parse(token: &str) -> Option<Self> {
    match token {
      "i686" | "i586" | "i486" | "i386" | "x86" => Some(Self::I686),
      "x86_64" | "amd64" => Some(Self::X86_64),
      "aarch64" | "arm64" => Some(Self::Aarch64),
      "armv6l" => Some(Self::Armv6l),
      "armv7l" | "armv7" | "arm" => Some(Self::Armv7l),
      "powerpc64le" | "ppc64le" => Some(Self::Powerpc64le),
      "riscv64" => Some(Self::Riscv64),
      _ => None,
    }
  }

  /// Returns the canonical lowercase identifier for this architecture
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::I686 => "i686",
      Self::X86_64 => "x86_64",
      Self::Aarch64 => "aarch64",
      Self::Armv6l => "armv6l",
      Self::Armv7l => "armv7l",
      Self::Powerpc64le => "powerpc64le",
      Self::Riscv64 => "riscv64",
    }
  }

  pub fn is_arm32(&self) -> bool {
    matches!(self, Self::Armv6l | Self::Armv7l)
  }

  pub fn pointer_width(&self) -> u8 {
    match self {
      Self::I686 | Self::Armv6l | Self::Armv7l => 32,
      _ => 64,
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
