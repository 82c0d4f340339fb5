//! Terminal output for build reports.
//!
//! Text mode prints one colored line per platform followed by indented
//! details; JSON mode prints a single document on stdout.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
}

/// Leading characters of a sha256 shown in text mode.
const SHORT_HASH_LEN: usize = 12;

pub fn short_hash(hash: &str) -> &str {
  &hash[..hash.len().min(SHORT_HASH_LEN)]
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  match bytes {
    b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
    b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
    b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
    b => format!("{} B", b),
  }
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, duration.subsec_millis() / 10)
  } else {
    format!("{}ms", duration.subsec_millis())
  }
}

/// Last `lines` lines of captured script output.
pub fn tail(output: &str, lines: usize) -> Vec<&str> {
  let all: Vec<&str> = output.lines().collect();
  all[all.len().saturating_sub(lines)..].to_vec()
}

/// `✓ <platform> → <detail>`
pub fn print_platform_ok(platform: &str, detail: &str) {
  println!(
    "{} {} {} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    platform.if_supports_color(Stream::Stdout, |s| s.bold()),
    symbols::ARROW,
    detail
  );
}

/// `✗ <platform> [<kind>]: <message>` on stderr.
pub fn print_platform_failed(platform: &str, kind: &str, message: &str) {
  eprintln!(
    "{} {} [{}]: {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    platform.if_supports_color(Stream::Stderr, |s| s.bold()),
    kind.if_supports_color(Stream::Stderr, |s| s.red()),
    message
  );
}

pub fn print_platform_warning(platform: &str, message: &str) {
  eprintln!(
    "{} {}: {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    platform,
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

/// Indented script output under a failed platform.
pub fn print_script_output(output: &str, lines: usize) {
  for line in tail(output, lines) {
    eprintln!("    {}", line.if_supports_color(Stream::Stderr, |s| s.dimmed()));
  }
}

pub fn print_note(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
