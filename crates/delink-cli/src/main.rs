//! delink CLI - replace symlinks in a deploy tree with real copies

use camino::Utf8PathBuf;
use clap::Parser;
use miette::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use delink_core::{Config, Materializer};

/// delink - replace symlinks in a deploy tree with real copies of their targets
#[derive(Debug, Parser)]
#[command(name = "delink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding delink.toml (default: current directory)
    #[arg(short = 'w', long)]
    workspace: Option<Utf8PathBuf>,

    /// Directory tree to materialize (overrides materialize.root)
    #[arg(short, long)]
    root: Option<Utf8PathBuf>,

    /// Dry run - show which symlinks would be replaced
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Determine workspace root
    let workspace_root = if let Some(path) = cli.workspace {
        path
    } else {
        std::env::current_dir()
            .ok()
            .and_then(|p| Utf8PathBuf::try_from(p).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("."))
    };

    let config = Config::load(&workspace_root)?;
    let root = config.resolve_root(&workspace_root, cli.root.as_deref());

    let materializer = Materializer::new()
        .with_staging_dir(config.resolve_staging_dir(&workspace_root))
        .with_dry_run(cli.dry_run);

    let dry_run = cli.dry_run;
    let report = materializer.run(&root, &mut |path, outcome| {
        if let Some(line) = outcome.report_line(path, dry_run) {
            println!("{}", line);
        }
    })?;

    println!("{}", report);
    Ok(())
}
