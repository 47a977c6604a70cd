//! Per-invocation execution flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags threaded through every operation.
///
/// Nothing in the crate reads process-wide configuration; components receive
/// this value explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Report what would happen without writing to sysfs or signalling processes.
    pub dry_run: bool,
    /// Emit debug-level logging.
    pub verbose: bool,
    /// Override the "already isolated" / "nothing to restore" guards.
    pub force: bool,
    /// Skip the interactive confirmation before terminating device holders.
    pub assume_yes: bool,
}

impl ExecutionContext {
    pub fn dry_run() -> Self {
        Self { dry_run: true, ..Self::default() }
    }
}

/// Cancellation flag set from a signal handler and polled between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
