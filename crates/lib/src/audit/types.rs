use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Warning,
  Fatal,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Severity::Info => "info",
      Severity::Warning => "warning",
      Severity::Fatal => "fatal",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditCategory {
  DisallowedLinkage,
  AbiMismatch,
  IsaMismatch,
  Unrelocatable,
  MissingLicense,
  MissingRuntimeDependency,
  UnparseableBinary,
}

impl AuditCategory {
  pub fn as_str(&self) -> &'static str {
    match self {
      AuditCategory::DisallowedLinkage => "disallowed-linkage",
      AuditCategory::AbiMismatch => "abi-mismatch",
      AuditCategory::IsaMismatch => "isa-mismatch",
      AuditCategory::Unrelocatable => "unrelocatable",
      AuditCategory::MissingLicense => "missing-license",
      AuditCategory::MissingRuntimeDependency => "missing-runtime-dependency",
      AuditCategory::UnparseableBinary => "unparseable-binary",
    }
  }
}

impl fmt::Display for AuditCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// A single observation about the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
  pub severity: Severity,
  /// Prefix-relative path of the offending file.
  pub path: PathBuf,
  pub category: AuditCategory,
  pub message: String,
}

impl fmt::Display for AuditFinding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{}] {} {}: {}",
      self.severity,
      self.category,
      self.path.display(),
      self.message
    )
  }
}

/// Findings of one audit, in discovery order. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
  findings: Vec<AuditFinding>,
}

impl AuditReport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, severity: Severity, path: impl Into<PathBuf>, category: AuditCategory, message: impl Into<String>) {
    self.findings.push(AuditFinding {
      severity,
      path: path.into(),
      category,
      message: message.into(),
    });
  }

  pub fn findings(&self) -> &[AuditFinding] {
    &self.findings
  }

  pub fn has_fatal(&self) -> bool {
    self.findings.iter().any(|f| f.severity == Severity::Fatal)
  }

  /// Category of the first fatal finding.
  pub fn first_fatal(&self) -> Option<&AuditFinding> {
    self.findings.iter().find(|f| f.severity == Severity::Fatal)
  }

  pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &AuditFinding> {
    self.findings.iter().filter(move |f| f.severity == severity)
  }

  pub fn in_category(&self, category: AuditCategory) -> impl Iterator<Item = &AuditFinding> {
    self.findings.iter().filter(move |f| f.category == category)
  }

  pub fn is_empty(&self) -> bool {
    self.findings.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn report_tracks_fatal_findings() {
    let mut report = AuditReport::new();
    report.push(Severity::Warning, "share", AuditCategory::MissingLicense, "no license");
    assert!(!report.has_fatal());

    report.push(Severity::Fatal, "bin/tool", AuditCategory::IsaMismatch, "aarch64 binary");
    assert!(report.has_fatal());
    assert_eq!(report.first_fatal().unwrap().category, AuditCategory::IsaMismatch);
    assert_eq!(report.with_severity(Severity::Warning).count(), 1);
    assert_eq!(
      report.findings()[1].to_string(),
      "[fatal] isa-mismatch bin/tool: aarch64 binary"
    );
  }

  #[test]
  fn categories_serialize_kebab_case() {
    let json = serde_json::to_string(&AuditCategory::MissingRuntimeDependency).unwrap();
    assert_eq!(json, "\"missing-runtime-dependency\"");
  }
}
