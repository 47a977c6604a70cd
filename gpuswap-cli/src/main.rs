use clap::{Parser, Subcommand};
use gpuswap_core::{CancelFlag, Config, ExecutionContext, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod signals;

#[derive(Parser)]
#[command(name = "gpuswap")]
#[command(about = "Hand GPUs between host drivers and vfio-pci", long_about = None)]
struct Cli {
    /// Show what would happen without touching devices or processes
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Proceed even if the ledger says otherwise
    #[arg(short, long, global = true)]
    force: bool,

    /// Terminate device holders without asking
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,

    /// Config file (default: $GPUSWAP_CONFIG or /etc/gpuswap/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ledger file (overrides the config)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move devices from their host drivers to vfio-pci
    #[command(visible_alias = "isolate")]
    Acquire {
        /// PCI addresses (0000:01:00.0 or 01:00.0); defaults to the configured devices
        devices: Vec<String>,
    },

    /// Return recorded devices to their original drivers
    #[command(visible_alias = "restore")]
    Release,

    /// Show ledger contents and live driver bindings
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = gpuswap_core::init_observability(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            commands::report_error(&e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(ledger) = cli.ledger {
        config.ledger_path = ledger;
    }

    let ctx = ExecutionContext {
        dry_run: cli.dry_run,
        verbose: cli.verbose,
        force: cli.force,
        assume_yes: cli.assume_yes,
    };

    let cancel = CancelFlag::new();
    if let Err(e) = signals::install(&cancel) {
        tracing::warn!(
            error = %e,
            "Failed to install signal handlers; Ctrl-C will abort immediately"
        );
    }
    let orchestrator = Orchestrator::system(&config).with_cancel(cancel);

    let status = match cli.command {
        Commands::Acquire { devices } => commands::acquire(&orchestrator, &devices, &ctx),
        Commands::Release => commands::release(&orchestrator, &ctx),
        Commands::Status => commands::status(&orchestrator),
    };

    status.into()
}
