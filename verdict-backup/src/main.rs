//! Verdict Backup - command line entry point.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use verdict_backup::progress::ConsoleProgress;
use verdict_backup::registry::target::format_timestamp;
use verdict_backup::shutdown::ShutdownCoordinator;
use verdict_backup::{utils, Engine, EngineConfig, RunOptions, TargetSummary};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to engine configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the target registry (overrides config)
    #[arg(short, long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List targets and whether their destination is connected
    List,
    /// Register a new target
    Add {
        name: String,
        source: PathBuf,
        dest: PathBuf,
    },
    /// Forget a target (destination data is kept)
    Remove { name: String },
    /// Cross-check the manifest against the destination
    Check {
        name: String,
        /// Drop entries for missing files and fill in missing checksums
        #[arg(long)]
        repair: bool,
    },
    /// Recompute all checksums and report mismatches
    Verify { name: String },
    /// Run a backup
    Run {
        name: String,
        /// Show what would change without changing anything
        #[arg(long)]
        dry: bool,
        /// Include optional paths
        #[arg(long)]
        full: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(registry) = args.registry {
        config.registry.path = registry;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "Starting verdict-backup v{} (registry: {})",
        env!("CARGO_PKG_VERSION"),
        config.registry.path.display()
    );

    let engine = Engine::open(config);

    let shutdown = ShutdownCoordinator::new();
    let cancel = shutdown.token();
    tokio::spawn(async move { shutdown.wait_for_signal().await });

    let progress = ConsoleProgress::new();

    match args.command {
        Command::List => {
            println!("List of targets:");
            for target in engine.list_targets().await {
                print_target(&target);
            }
            for name in engine.skipped_targets().await {
                println!("{:<12}[invalid entry, ignored]", name);
            }
        }
        Command::Add { name, source, dest } => {
            let target = engine.add_target(&name, &source, &dest).await?;
            print_target(&target);
        }
        Command::Remove { name } => {
            engine.remove_target(&name).await?;
            println!("Removed target {}", name);
        }
        Command::Check { name, repair } => {
            let report = engine.check_target(&name, repair, &progress, cancel).await?;
            println!(
                "{} missing file(s), {} missing checksum(s)",
                report.missing_files.len(),
                report.missing_checksums.len()
            );
            if repair {
                println!(
                    "Removed {} entr(ies), added {} checksum(s), {} unresolved",
                    report.removed,
                    report.added.len(),
                    report.unresolved.len()
                );
            }
        }
        Command::Verify { name } => {
            let report = engine.verify_target(&name, &progress, cancel).await?;
            println!("Log: {}", report.log_file.display());
            if !report.success() {
                bail!("{} invalid checksum(s)", report.mismatches.len());
            }
            println!("All {} checksum(s) valid", report.checked);
        }
        Command::Run { name, dry, full } => {
            let report = engine.run_backup(&name, RunOptions { dry, full }, &progress, cancel).await?;
            println!(
                "Backup {}: {} updated, {} hard link(s), {} deleted",
                format_timestamp(&report.timestamp),
                report.changes.updated,
                report.changes.hard_linked,
                report.changes.deleted
            );
        }
    }

    Ok(())
}

fn print_target(target: &TargetSummary) {
    let status = if target.connected { "[ready]" } else { "[N/A]" };
    let last_backup = target
        .last_backup_time
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{:<12}{:<40}{:<40}{:<8} last backup: {}",
        target.name,
        target.source_path.display(),
        target.dest_path.display(),
        status,
        last_backup
    );
    if let Some(days) = target.backup_overdue_days {
        println!("{:<12}backup overdue ({} days since last backup)", "", days);
    }
    if let Some(days) = target.verify_overdue_days {
        println!("{:<12}verification overdue ({} days since last verification)", "", days);
    }
}
