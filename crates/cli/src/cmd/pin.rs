//! `repro pin`: the only command that writes the pin file.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::ValueEnum;
use owo_colors::OwoColorize;

use repro_lib::config::{ConfigError, ProjectConfig};
use repro_lib::consts::PINS_FILENAME;
use repro_lib::fetch::{DEFAULT_FETCH_TIMEOUT, Fetcher};
use repro_lib::pins::{PinContext, PinFile, PinKind, PinSource, add_pin, update_pins};
use repro_lib::pipeline::Caches;
use repro_lib::store::lock::{CacheLock, LockMode};

use super::runtime;
use crate::output::{
  OutputFormat, format_duration, print_info, print_json, print_stat, print_success, symbols, truncate_hash,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
  Toolchain,
  Registry,
  Tool,
}

impl From<KindArg> for PinKind {
  fn from(kind: KindArg) -> Self {
    match kind {
      KindArg::Toolchain => PinKind::Toolchain,
      KindArg::Registry => PinKind::Registry,
      KindArg::Tool => PinKind::Tool,
    }
  }
}

pub struct PinAddArgs {
  pub name: String,
  pub kind: KindArg,
  pub url: Option<String>,
  pub git: Option<String>,
  pub rev: Option<String>,
  pub label: Option<String>,
}

impl PinAddArgs {
  fn source(&self) -> Result<PinSource> {
    match (&self.git, &self.url) {
      (Some(git), url) => Ok(PinSource::Git {
        url: url.clone().unwrap_or_else(|| git.clone()),
        git: git.clone(),
        rev: self.rev.clone(),
      }),
      (None, Some(url)) => Ok(PinSource::Archive { url: url.clone() }),
      (None, None) => anyhow::bail!("pin '{}' needs --url or --git", self.name),
    }
  }
}

/// Pin file location and fetch timeout. Pins may be added before
/// `repro.toml` exists, in which case the defaults apply.
fn pin_settings(root: &Path) -> Result<(PathBuf, Fetcher)> {
  let (path, timeout) = match ProjectConfig::load(root) {
    Ok(config) => (config.pins_path(root), config.fetch_timeout()?),
    Err(ConfigError::NotFound(_)) => (root.join(PINS_FILENAME), DEFAULT_FETCH_TIMEOUT),
    Err(e) => return Err(e).context("Failed to load repro.toml"),
  };
  let fetcher = Fetcher::new(timeout).context("Failed to create HTTP client")?;
  Ok((path, fetcher))
}

pub fn cmd_pin_add(root: &Path, args: &PinAddArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let (path, fetcher) = pin_settings(root)?;
  let caches = Caches::from_env();
  let _cache = CacheLock::acquire(&caches.root, LockMode::Shared, "pin-add").context("Failed to lock the cache")?;
  let ctx = PinContext {
    fetcher: &fetcher,
    store: &caches.store,
    git_cache: caches.git_dir.clone(),
  };
  let source = args.source()?;
  let label = args.label.as_deref().unwrap_or(&args.name);

  let rt = runtime()?;
  let record = rt
    .block_on(add_pin(&ctx, &path, &args.name, args.kind.into(), &source, label))
    .with_context(|| format!("Failed to pin '{}'", args.name))?;

  if output.is_json() {
    return print_json(&record);
  }

  print_success(&format!("Pinned {} ({} {})", args.name, record.kind, record.label));
  match (&record.sha256, &record.rev) {
    (Some(sha256), _) => print_stat("sha256", sha256.as_str()),
    (None, Some(rev)) => print_stat("rev", rev),
    (None, None) => {}
  }
  print_stat("Pin file", &path.display().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}

pub fn cmd_pin_update(root: &Path, names: Vec<String>, dry_run: bool) -> Result<()> {
  let start = Instant::now();
  let (path, fetcher) = pin_settings(root)?;
  let mut file = PinFile::load_required(&path).context("Failed to load pin file")?;
  let caches = Caches::from_env();
  let _cache = CacheLock::acquire(&caches.root, LockMode::Shared, "pin-update").context("Failed to lock the cache")?;
  let ctx = PinContext {
    fetcher: &fetcher,
    store: &caches.store,
    git_cache: caches.git_dir.clone(),
  };

  let rt = runtime()?;
  let result = rt
    .block_on(update_pins(&ctx, &mut file, &names))
    .context("Failed to update pins")?;

  if dry_run {
    println!("{}", "Dry run - pin file not written".yellow());
    println!();
  } else if !result.updated.is_empty() {
    file.save(&path).context("Failed to write pin file")?;
  }

  let prefix = if dry_run { "Would update" } else { "Updated" };
  for (name, (old, new)) in &result.updated {
    println!(
      "  {} {}: {} {} {}",
      symbols::MODIFY.yellow(),
      prefix,
      name.cyan(),
      format!("{} {}", truncate_hash(old), symbols::ARROW).dimmed(),
      truncate_hash(new).green()
    );
  }

  if result.updated.is_empty() {
    print_info("All pins are up to date");
  } else {
    println!();
    print_stat("Updated", &result.updated.len().to_string());
  }
  print_stat("Unchanged", &result.unchanged.len().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}

pub fn cmd_pin_list(root: &Path, output: OutputFormat) -> Result<()> {
  let (path, _) = pin_settings(root)?;
  let file = PinFile::load(&path).context("Failed to load pin file")?.unwrap_or_default();

  if output.is_json() {
    return print_json(&file);
  }

  if file.pins.is_empty() {
    print_info(&format!("No pins in {}", path.display()));
    return Ok(());
  }
  for (name, record) in &file.pins {
    println!(
      "  {} {} {} {}",
      name.cyan(),
      format!("[{}]", record.kind).dimmed(),
      record.label,
      truncate_hash(record.reference()).dimmed()
    );
  }
  Ok(())
}
