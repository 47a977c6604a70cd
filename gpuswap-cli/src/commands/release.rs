//! `gpuswap release` command

use super::report_error;
use colored::Colorize;
use gpuswap_core::orchestrator::ReleaseReport;
use gpuswap_core::vfio::RebindOutcome;
use gpuswap_core::{ExecutionContext, ExitStatus, Orchestrator, SwapError};

/// Return recorded devices to the host.
pub fn release(orchestrator: &Orchestrator, ctx: &ExecutionContext) -> ExitStatus {
    let report = match orchestrator.try_release(ctx) {
        Ok(report) => report,
        Err(e) => {
            report_error(&e);
            return ExitStatus::Failure;
        }
    };

    print_report(&report);

    if report.failed.is_empty() {
        ExitStatus::Success
    } else {
        let devices = report.failed.iter().map(|f| f.address.to_string()).collect();
        report_error(&SwapError::ReleaseIncomplete { devices });
        ExitStatus::Failure
    }
}

fn print_report(report: &ReleaseReport) {
    for (address, outcome) in &report.restored {
        let detail = match outcome {
            RebindOutcome::AlreadyBound(driver) => format!("already on {}", driver),
            RebindOutcome::Bound(driver) => format!("bound to {}", driver),
            RebindOutcome::BoundOther { expected, actual } => {
                format!("bound to {} (recorded {})", actual, expected).yellow().to_string()
            }
            RebindOutcome::Unbound => "left unbound".yellow().to_string(),
            RebindOutcome::Planned => "would rebind".to_string(),
        };
        println!("{} {} {}", "✓".green().bold(), address.to_string().bold(), detail);
    }

    for failure in &report.failed {
        let address = failure.address.to_string();
        println!("{} {} {}", "✗".red().bold(), address.bold(), failure.reason);
    }

    if report.ledger_cleared {
        println!("  Ledger cleared");
    }
}
