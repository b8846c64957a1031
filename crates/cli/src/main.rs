mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{KindArg, PinAddArgs, ReleaseArgs};
use output::{OutputFormat, print_error};

/// repro - reproducible builds and tag-triggered releases
#[derive(Parser)]
#[command(name = "repro")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// More logging (-v info, -vv debug). RUST_LOG takes precedence.
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  /// Project root (where repro.toml lives)
  #[arg(short = 'C', long = "project", global = true, default_value = ".")]
  project: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Manage pinned toolchains, registries and tools
  Pin {
    #[command(subcommand)]
    command: PinCommands,
  },

  /// Vendor the dependencies named by Cargo.lock
  Vendor,

  /// Build the project's binary for this host
  Build {
    /// Skip `cargo test` before accepting the artifact
    #[arg(long)]
    no_test: bool,

    /// Copy the artifact to this path (a directory receives the binary name)
    #[arg(long)]
    out: Option<PathBuf>,
  },

  /// Build twice in separate sandboxes and compare the artifacts
  Verify {
    /// Skip `cargo test`
    #[arg(long)]
    no_test: bool,
  },

  /// Build and upload every release matrix entry for a tag
  Release {
    /// Tag to release (default: GITHUB_REF)
    #[arg(long)]
    tag: Option<String>,

    /// Only run the matrix entries for this OS (linux, macos)
    #[arg(long)]
    only: Option<String>,

    /// Upload into a directory instead of GitHub Releases
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Check out the tag from this git repository instead of copying the project
    #[arg(long)]
    source: Option<String>,

    /// Skip `cargo test` in every job
    #[arg(long)]
    no_test: bool,
  },

  /// Show platform, cache and pin information
  Info,

  /// Remove unreferenced cache entries
  Gc {
    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,
  },
}

#[derive(Subcommand)]
enum PinCommands {
  /// Pin an archive URL by sha256, or a git repository by commit
  Add {
    /// Pin name (e.g. rust, rust-x86_64-linux, crates-io)
    name: String,

    #[arg(long, value_enum, default_value_t = KindArg::Toolchain)]
    kind: KindArg,

    /// Archive or download base URL
    #[arg(long, required_unless_present = "git")]
    url: Option<String>,

    /// Git repository to pin by commit
    #[arg(long)]
    git: Option<String>,

    /// Revision to resolve (default: HEAD)
    #[arg(long, requires = "git")]
    rev: Option<String>,

    /// Version label (default: the pin name)
    #[arg(long)]
    label: Option<String>,
  },

  /// Re-resolve pins and report what changed
  Update {
    /// Pins to update (default: all)
    names: Vec<String>,

    /// Report changes without writing the pin file
    #[arg(long)]
    dry_run: bool,
  },

  /// List pins
  List,
}

fn init_tracing(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let root = cli.project.as_path();
  let output = cli.output;

  let result = match cli.command {
    Commands::Pin { command } => match command {
      PinCommands::Add {
        name,
        kind,
        url,
        git,
        rev,
        label,
      } => cmd::cmd_pin_add(
        root,
        &PinAddArgs {
          name,
          kind,
          url,
          git,
          rev,
          label,
        },
        output,
      ),
      PinCommands::Update { names, dry_run } => cmd::cmd_pin_update(root, names, dry_run),
      PinCommands::List => cmd::cmd_pin_list(root, output),
    },
    Commands::Vendor => cmd::cmd_vendor(root),
    Commands::Build { no_test, out } => cmd::cmd_build(root, no_test, out.as_deref(), output),
    Commands::Verify { no_test } => cmd::cmd_verify(root, no_test, output),
    Commands::Release {
      tag,
      only,
      dir,
      source,
      no_test,
    } => cmd::cmd_release(
      root,
      &ReleaseArgs {
        tag,
        only,
        dir,
        source,
        no_test,
      },
      output,
    ),
    Commands::Info => cmd::cmd_info(root),
    Commands::Gc { dry_run } => cmd::cmd_gc(root, dry_run, output),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      print_error(&format!("{:#}", e));
      ExitCode::FAILURE
    }
  }
}
