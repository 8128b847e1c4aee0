mod apply;
mod catalog;
mod error;
mod guard;
mod install;
mod report;
mod util;
mod verify;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use simplelog::{Config, LevelFilter, SimpleLogger};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use crate::apply::RunStatus;
use crate::catalog::Catalog;
use crate::install::{InstallLocator, Installation, ManualLocator, RegistryLocator};

const EXIT_PARTIAL: u8 = 2;
const EXIT_ABORTED: u8 = 3;

#[derive(Parser)]
#[command(
    name = "wechat-multipatch",
    version,
    about = "Patch WeChatWin.dll so several WeChat instances can run at once"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Patch this file instead of the one found through the registry
    #[arg(long)]
    dll: Option<PathBuf>,
    /// Installed version of the file given with --dll
    #[arg(long, requires = "dll")]
    product_version: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the target and apply every patch site
    Patch {
        #[command(flatten)]
        target: TargetArgs,
        /// Proceed on a version mismatch without asking
        #[arg(long, short)]
        yes: bool,
        /// Do not try to close running WeChat instances first
        #[arg(long)]
        no_kill: bool,
        /// Suffix appended to the target path for the backup copy
        #[arg(long, default_value = ".bak")]
        backup_suffix: String,
    },
    /// Report the state of every patch site without writing anything
    Check {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Copy the backup back over the target
    Restore {
        #[command(flatten)]
        target: TargetArgs,
        /// Do not try to close running WeChat instances first
        #[arg(long)]
        no_kill: bool,
        /// Suffix the backup was created with
        #[arg(long, default_value = ".bak")]
        backup_suffix: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // clap exits with 2 on usage errors, which would read as a partial patch.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_ABORTED)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = SimpleLogger::init(level, Config::default()) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(EXIT_ABORTED)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let catalog = Catalog::builtin().context("Built-in patch catalog is invalid")?;

    match command {
        Commands::Patch {
            target,
            yes,
            no_kill,
            backup_suffix,
        } => {
            let install = locate(&target)?;
            println!(
                "Found {} {} at {}",
                catalog.product,
                version_text(&install),
                install.location.display()
            );

            if !catalog.matches_revision(install.version.as_deref()) {
                println!(
                    "Warning: patch sites were derived from {} {}, you have {}.",
                    catalog.product,
                    catalog.revision,
                    version_text(&install)
                );
                if !yes && !confirm("Continue? (y/N): ")? {
                    println!("Aborted, nothing was changed.");
                    return Ok(ExitCode::from(EXIT_ABORTED));
                }
            }

            let dll = install::find_target(&install, &catalog.file_name)?;

            if !no_kill {
                guard::ensure_not_running(&catalog.image_name).await;
            }
            let backup = guard::ensure_backup(&dll, &backup_suffix).await?;
            log::debug!(
                "{} backup {} (BLAKE3 {})",
                if backup.created { "New" } else { "Existing" },
                backup.path.display(),
                backup.digest.to_hex()
            );

            println!("Patching {}", dll.display());
            let start = Instant::now();
            let report = tokio::task::block_in_place(|| apply::apply_all(&dll, &catalog))?;
            let elapsed = start.elapsed();

            println!("{}", report);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());

            match report.status() {
                RunStatus::FullyApplied => {
                    println!("\nTry launching multiple {} instances.", catalog.product);
                    Ok(ExitCode::SUCCESS)
                }
                RunStatus::Partial => {
                    println!("\nOriginal file kept at {}", backup.path.display());
                    Ok(ExitCode::from(EXIT_PARTIAL))
                }
            }
        }
        Commands::Check { target } => {
            let install = locate(&target)?;
            let dll = install::find_target(&install, &catalog.file_name)?;
            println!("Checking {} ({})", dll.display(), version_text(&install));
            if !catalog.matches_revision(install.version.as_deref()) {
                println!("Warning: patch sites were derived from {}", catalog.revision);
            }

            let sites = tokio::task::block_in_place(|| apply::inspect(&dll, &catalog))?;
            for site in &sites {
                println!("  {}", site);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restore {
            target,
            no_kill,
            backup_suffix,
        } => {
            let install = locate(&target)?;
            let dll = install::find_target(&install, &catalog.file_name)?;

            if !no_kill {
                guard::ensure_not_running(&catalog.image_name).await;
            }
            let digest = guard::restore_backup(&dll, &backup_suffix).await?;

            println!("Restored {}", dll.display());
            println!("  BLAKE3: {}", digest.to_hex());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn locate(target: &TargetArgs) -> Result<Installation> {
    let locator: Box<dyn InstallLocator> = match &target.dll {
        Some(path) => Box::new(ManualLocator {
            path: path.clone(),
            version: target.product_version.clone(),
        }),
        None => Box::new(RegistryLocator::default()),
    };
    Ok(locator.locate()?)
}

fn version_text(install: &Installation) -> &str {
    install.version.as_deref().unwrap_or("(unknown version)")
}

/// Ask on stdin; anything but `y`/`yes` (including EOF) declines.
fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
