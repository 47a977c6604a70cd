//! `gpuswap acquire` command

use super::report_error;
use colored::Colorize;
use gpuswap_core::evict::Freed;
use gpuswap_core::{ExecutionContext, ExitStatus, Orchestrator};

/// Move devices to the isolation driver.
pub fn acquire(
    orchestrator: &Orchestrator,
    devices: &[String],
    ctx: &ExecutionContext,
) -> ExitStatus {
    let report = match orchestrator.try_acquire(devices, ctx) {
        Ok(report) => report,
        Err(e) => {
            report_error(&e);
            return ExitStatus::Failure;
        }
    };

    let verb = if ctx.dry_run { "Would acquire" } else { "Acquired" };
    for address in &report.devices {
        println!("{} {} {}", "✓".green().bold(), verb, address.to_string().bold());
    }

    match &report.freed {
        Freed::Evicted { steps } => println!("  Evicted device holders ({} step(s))", steps),
        Freed::DryRun { targets } => {
            for target in targets {
                println!("  Would terminate {}", target);
            }
        }
        Freed::NoNodes | Freed::NoHolders => {}
    }

    for node in &report.group_nodes {
        println!("  {}", node.display());
    }

    ExitStatus::Success
}
