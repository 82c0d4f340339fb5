use std::fmt;

/// Operating system families a build can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Os {
  Linux,
  MacOs,
  Windows,
  FreeBsd,
}

impl Os {
  /// Detect the current operating system at runtime
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::MacOs),
      "windows" => Some(Self::Windows),
      "freebsd" => Some(Self::FreeBsd),
      _ => None,
    }
  }

  /// Returns the lowercase string identifier for this OS
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::MacOs => "macos",
      Self::Windows => "windows",
      Self::FreeBsd => "freebsd",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// C library flavour. Only meaningful on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Libc {
  Glibc,
  Musl,
}

impl Libc {
  /// Detect the C library the current process was built against.
  pub fn current() -> Option<Self> {
    if cfg!(target_env = "musl") {
      Some(Self::Musl)
    } else if cfg!(target_env = "gnu") {
      Some(Self::Glibc)
    } else {
      None
    }
  }

  /// Triplet token for this libc (`gnu` / `musl`).
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Glibc => "gnu",
      Self::Musl => "musl",
    }
  }
}

impl fmt::Display for Libc {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Calling convention tag. Only 32-bit ARM Linux carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallAbi {
  EabiHf,
}

impl CallAbi {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::EabiHf => "eabihf",
    }
  }
}

impl fmt::Display for CallAbi {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
