//! Terminal output: status lines, `label: value` stats and `--output json`.
//!
//! Status lines go to stdout, except errors and failed release jobs, which
//! go to stderr so a piped `--output json` stays parseable.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream, Style};

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
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const MODIFY: &str = "~";
}

#[derive(Clone, Copy)]
enum Status {
  Success,
  Info,
  Error,
}

impl Status {
  fn symbol(self) -> &'static str {
    match self {
      Status::Success => symbols::SUCCESS,
      Status::Info => symbols::INFO,
      Status::Error => symbols::ERROR,
    }
  }

  fn style(self) -> Style {
    match self {
      Status::Success => Style::new().green(),
      Status::Info => Style::new().blue(),
      Status::Error => Style::new().red(),
    }
  }

  fn stream(self) -> Stream {
    match self {
      Status::Error => Stream::Stderr,
      _ => Stream::Stdout,
    }
  }
}

fn status_line(status: Status, message: &str) {
  let stream = status.stream();
  let symbol = status.symbol();
  let painted = symbol.if_supports_color(stream, |s| s.style(status.style()));
  match stream {
    Stream::Stderr => eprintln!("{} {}", painted, message),
    _ => println!("{} {}", painted, message),
  }
}

/// First 12 characters of a hash or commit.
pub fn truncate_hash(hash: &str) -> &str {
  &hash[..hash.len().min(12)]
}

/// Binary units, one decimal: `512 B`, `1.5 KB`, `3.2 MB`.
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

/// `50ms`, `1.50s`, then whole seconds through humantime (`1m 5s`).
pub fn format_duration(duration: Duration) -> String {
  if duration.as_secs() == 0 {
    format!("{}ms", duration.subsec_millis())
  } else if duration.as_secs() < 60 {
    format!("{:.2}s", duration.as_secs_f64())
  } else {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
  }
}

pub fn print_success(message: &str) {
  status_line(Status::Success, message);
}

pub fn print_info(message: &str) {
  status_line(Status::Info, message);
}

pub fn print_error(message: &str) {
  let message = message.if_supports_color(Stream::Stderr, |s| s.red()).to_string();
  status_line(Status::Error, &message);
}

/// A failed release job: `✗ linux (upload): message`.
pub fn print_failure(label: &str, stage: &str, message: &str) {
  let line = format!(
    "{} ({}): {}",
    label.if_supports_color(Stream::Stderr, |s| s.bold()),
    stage.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message
  );
  status_line(Status::Error, &line);
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn truncates_hashes() {
    assert_eq!(truncate_hash("abcdef123456789"), "abcdef123456");
    assert_eq!(truncate_hash("short"), "short");
    assert_eq!(truncate_hash(""), "");
  }

  #[test]
  fn formats_bytes() {
    assert_eq!(format_bytes(500), "500 B");
    assert_eq!(format_bytes(1024), "1.0 KB");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(1048576), "1.0 MB");
    assert_eq!(format_bytes(1073741824), "1.0 GB");
    assert_eq!(format_bytes(1024u64.pow(4) * 3), "3.0 TB");
  }

  #[test]
  fn formats_durations() {
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    assert_eq!(format_duration(Duration::from_millis(65_400)), "1m 5s");
  }

  #[test]
  fn every_status_prints() {
    for status in [Status::Success, Status::Info, Status::Error] {
      status_line(status, "message");
    }
    print_failure("linux", "upload", "connection reset");
  }

  #[test]
  fn errors_go_to_stderr() {
    assert!(matches!(Status::Error.stream(), Stream::Stderr));
    assert!(matches!(Status::Success.stream(), Stream::Stdout));
    assert!(matches!(Status::Info.stream(), Stream::Stdout));
  }

  #[test]
  fn json_is_the_only_structured_format() {
    assert!(OutputFormat::Json.is_json());
    assert!(!OutputFormat::default().is_json());
  }
}
