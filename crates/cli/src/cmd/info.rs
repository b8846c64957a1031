use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;

use repro_lib::config::ProjectConfig;
use repro_lib::pins::PinFile;
use repro_lib::platform::{Platform, paths};

use crate::output::{print_stat, truncate_hash};

pub fn cmd_info(root: &Path) -> Result<()> {
  println!("System:");
  match Platform::current() {
    Some(platform) => print_stat("Platform", &platform.triple()),
    None => print_stat("Platform", &format!("unsupported ({})", std::env::consts::OS)),
  }
  print_stat("Cache", &paths::cache_dir().display().to_string());

  let Ok(config) = ProjectConfig::load(root) else {
    println!();
    println!("{}", "No repro.toml in this directory.".dimmed());
    return Ok(());
  };

  println!();
  println!("Project:");
  print_stat("Binary", &config.project.binary);
  print_stat("Release tags", &config.release.tag_pattern);
  print_stat("Matrix", &config.release.matrix.len().to_string());

  let pins_path = config.pins_path(root);
  println!();
  match PinFile::load(&pins_path)? {
    Some(pins) if !pins.pins.is_empty() => {
      println!("Pins ({}):", pins_path.display());
      for (name, record) in &pins.pins {
        print_stat(name, &format!("{} {} {}", record.kind, record.label, truncate_hash(record.reference())));
      }
    }
    _ => println!("{}", format!("No pins in {}", pins_path.display()).dimmed()),
  }
  Ok(())
}
