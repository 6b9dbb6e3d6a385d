//! Terminal output helpers for the hit CLI.

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

/// Status line for a completed operation.
pub fn done(message: &str) {
  println!("{} {message}", "ok".if_supports_color(Stream::Stdout, |s| s.green()));
}

/// Neutral status line.
pub fn note(message: &str) {
  println!("{} {message}", "--".if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

/// An indented `name: value` detail line under a status line.
pub fn field(name: &str, value: impl std::fmt::Display) {
  println!("    {name}: {value}");
}

pub fn emit_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
  let rendered = serde_json::to_string_pretty(value).context("rendering json output")?;
  println!("{rendered}");
  Ok(())
}

/// Binary-prefixed size; one decimal while the leading figure is small
/// enough for it to matter.
pub fn human_size(bytes: u64) -> String {
  const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{bytes} B")
  } else if value < 10.0 {
    format!("{value:.1} {}", UNITS[unit])
  } else {
    format!("{value:.0} {}", UNITS[unit])
  }
}

/// Elapsed wall time at the precision a human cares about.
pub fn human_elapsed(elapsed: Duration) -> String {
  let secs = elapsed.as_secs();
  if secs == 0 {
    format!("{}ms", elapsed.as_millis())
  } else if secs < 60 {
    format!("{:.1}s", elapsed.as_secs_f64())
  } else {
    format!("{}m{:02}s", secs / 60, secs % 60)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sizes_use_binary_prefixes() {
    assert_eq!(human_size(0), "0 B");
    assert_eq!(human_size(512), "512 B");
    assert_eq!(human_size(2048), "2.0 KiB");
    assert_eq!(human_size(50 * 1024 * 1024), "50 MiB");
  }

  #[test]
  fn elapsed_scales_units() {
    assert_eq!(human_elapsed(Duration::from_millis(250)), "250ms");
    assert_eq!(human_elapsed(Duration::from_millis(2500)), "2.5s");
    assert_eq!(human_elapsed(Duration::from_secs(75)), "1m15s");
  }
}
