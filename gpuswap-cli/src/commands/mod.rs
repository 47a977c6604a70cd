//! CLI command implementations

pub mod acquire;
pub mod release;
pub mod status;

pub use acquire::acquire;
pub use release::release;
pub use status::status;

use colored::Colorize;
use gpuswap_core::SwapError;

/// Print a failure with a next-step hint where one exists.
pub fn report_error(err: &SwapError) {
    eprintln!("{} {}", "✗".red().bold(), err);

    let hint = match err {
        SwapError::AlreadyIsolated { .. } => Some("run `gpuswap release` first, or pass --force"),
        SwapError::NothingToRestore { .. } => {
            Some("pass --force to re-probe the configured devices anyway")
        }
        SwapError::DisplayServerHolder { .. } => {
            Some("log out of the graphical session or switch it to another GPU")
        }
        SwapError::ConsentRefused => Some("pass --yes to skip the prompt"),
        SwapError::Cancelled | SwapError::RebindFailed { .. } | SwapError::WrongDriver { .. } => {
            Some("run `gpuswap release` to restore recorded devices")
        }
        SwapError::ReleaseIncomplete { .. } => {
            Some("the ledger was kept; fix the failing devices and run `gpuswap release` again")
        }
        _ => None,
    };
    if let Some(hint) = hint {
        eprintln!("  {} {}", "hint:".yellow(), hint);
    }
}
