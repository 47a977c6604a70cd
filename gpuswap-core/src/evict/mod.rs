//! Reclaiming a device from the processes that hold its nodes.
//!
//! # Protocol
//!
//! 1. Find holders of the device nodes and resolve their names.
//! 2. Abort if any holder is a display server, compositor or session
//!    manager. No signal is sent in that case, whatever the flags say.
//! 3. Dry run stops here.
//! 4. Ask the operator (unless `--yes`).
//! 5. Walk [`ESCALATION`]: SIGTERM by pid, SIGTERM by name, SIGKILL by name,
//!    polling for the nodes to be released after each step.
//! 6. Abort if anything still holds the nodes; the caller must not unbind.
//!
//! Name-based steps exist for supervisors that respawn a killed child under a
//! new pid before a pid-only kill converges.

mod procfs;
mod prompt;

pub use procfs::{Procfs, PROC_ROOT};
pub use prompt::{TimedPrompt, DEFAULT_CONSENT_TIMEOUT};

use crate::context::ExecutionContext;
use crate::error::{Result, SwapError};
use crate::retry::RetryPolicy;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Processes that must never be killed: doing so takes down the operator's
/// own session.
pub const DISPLAY_SERVERS: &[&str] = &[
    "X",
    "Xorg",
    "Xwayland",
    "gnome-shell",
    "gnome-session-binary",
    "mutter",
    "kwin_wayland",
    "kwin_x11",
    "plasmashell",
    "sway",
    "Hyprland",
    "weston",
    "wayfire",
    "labwc",
    "river",
    "niri",
    "cosmic-comp",
    "gdm",
    "gdm-x-session",
    "gdm-wayland-session",
    "sddm",
    "sddm-greeter",
    "lightdm",
];

/// Kernel command names are truncated to 15 bytes.
const COMM_LEN: usize = 15;

/// Whether a resolved process name belongs to a display/session process.
pub fn is_display_server(name: &str) -> bool {
    DISPLAY_SERVERS.iter().any(|candidate| {
        let truncated = &candidate[..candidate.len().min(COMM_LEN)];
        name == *candidate || name == truncated
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// Enumerating and signalling processes.
pub trait ProcessTable {
    /// Pids holding any of `nodes` open or mapped, sorted.
    fn holders(&self, nodes: &BTreeSet<PathBuf>) -> Result<Vec<u32>>;

    /// Command name of a pid, `None` if it has gone away.
    fn name(&self, pid: u32) -> Option<String>;

    fn signal_pid(&self, pid: u32, signal: SignalKind) -> Result<()>;

    /// Signal every process with exactly this name; returns how many matched.
    fn signal_name(&self, name: &str, signal: SignalKind) -> Result<usize>;
}

/// Operator confirmation before anything is killed.
pub trait Consent {
    fn confirm(&self, question: &str) -> bool;
}

/// A process holding one of the device nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EvictionTarget {
    pub pid: u32,
    pub name: String,
}

impl std::fmt::Display for EvictionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.pid)
    }
}

/// Who an escalation step signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSelector {
    /// The pids found at the start of eviction.
    Pids,
    /// Every process sharing a name with one of the original holders.
    Names,
}

/// Which poll budget follows a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub signal: SignalKind,
    pub target: TargetSelector,
    pub budget: PollBudget,
}

pub const ESCALATION: [EscalationStep; 3] = [
    EscalationStep {
        signal: SignalKind::Terminate,
        target: TargetSelector::Pids,
        budget: PollBudget::Graceful,
    },
    EscalationStep {
        signal: SignalKind::Terminate,
        target: TargetSelector::Names,
        budget: PollBudget::Graceful,
    },
    EscalationStep {
        signal: SignalKind::Kill,
        target: TargetSelector::Names,
        budget: PollBudget::Forced,
    },
];

/// Poll budgets between escalation steps.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    pub graceful: RetryPolicy,
    pub forced: RetryPolicy,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        let step = Duration::from_millis(500);
        Self { graceful: RetryPolicy::new(5, step), forced: RetryPolicy::new(3, step) }
    }
}

impl EvictionPolicy {
    pub fn immediate() -> Self {
        Self { graceful: RetryPolicy::immediate(5), forced: RetryPolicy::immediate(3) }
    }

    fn budget(&self, budget: PollBudget) -> RetryPolicy {
        match budget {
            PollBudget::Graceful => self.graceful,
            PollBudget::Forced => self.forced,
        }
    }
}

/// The device nodes are free to unbind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freed {
    /// The device has no user-space nodes.
    NoNodes,
    /// Nothing holds the nodes.
    NoHolders,
    /// Dry run: these would have been signalled.
    DryRun { targets: Vec<EvictionTarget> },
    /// Holders exited after this many escalation steps.
    Evicted { steps: usize },
}

pub struct Evictor<'a> {
    processes: &'a dyn ProcessTable,
    consent: &'a dyn Consent,
    policy: EvictionPolicy,
}

impl<'a> Evictor<'a> {
    pub fn new(
        processes: &'a dyn ProcessTable,
        consent: &'a dyn Consent,
        policy: EvictionPolicy,
    ) -> Self {
        Self { processes, consent, policy }
    }

    /// Current holders with resolved names. Processes that exit mid-scan are dropped.
    pub fn targets(&self, nodes: &BTreeSet<PathBuf>) -> Result<Vec<EvictionTarget>> {
        Ok(self
            .processes
            .holders(nodes)?
            .into_iter()
            .filter_map(|pid| self.processes.name(pid).map(|name| EvictionTarget { pid, name }))
            .collect())
    }

    pub fn evict(&self, nodes: &BTreeSet<PathBuf>, ctx: &ExecutionContext) -> Result<Freed> {
        if nodes.is_empty() {
            return Ok(Freed::NoNodes);
        }

        let targets = self.targets(nodes)?;
        if targets.is_empty() {
            info!(nodes = nodes.len(), "No processes hold the device nodes");
            return Ok(Freed::NoHolders);
        }
        let names: BTreeSet<String> = targets.iter().map(|t| t.name.clone()).collect();

        let protected: Vec<String> =
            names.iter().filter(|n| is_display_server(n)).cloned().collect();
        if !protected.is_empty() {
            error!(processes = ?protected, "Display server holds the device; refusing to evict");
            return Err(SwapError::DisplayServerHolder { processes: protected });
        }

        let listing = targets.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ");
        if ctx.dry_run {
            info!(processes = %listing, "[dry-run] Would terminate device holders");
            return Ok(Freed::DryRun { targets });
        }

        if !ctx.assume_yes {
            let question = format!("Terminate processes using the GPU: {}?", listing);
            if !self.consent.confirm(&question) {
                return Err(SwapError::ConsentRefused);
            }
        }

        for (index, step) in ESCALATION.iter().enumerate() {
            self.apply(step, &targets, &names);

            let poll = self.policy.budget(step.budget);
            if poll.poll(|| Ok(self.processes.holders(nodes)?.is_empty()))? {
                info!(steps = index + 1, "Device holders exited");
                return Ok(Freed::Evicted { steps: index + 1 });
            }
            warn!(step = ?step, "Device nodes still held after escalation step");
        }

        let remaining: Vec<String> = self.targets(nodes)?.iter().map(|t| t.to_string()).collect();
        error!(holders = ?remaining, "Device nodes still held; not unbinding");
        Err(SwapError::HoldersRemain { holders: remaining })
    }

    /// Send one step's signal. Delivery errors are logged; the poll that
    /// follows decides whether the step worked.
    fn apply(&self, step: &EscalationStep, targets: &[EvictionTarget], names: &BTreeSet<String>) {
        match step.target {
            TargetSelector::Pids => {
                for target in targets {
                    info!(
                        pid = target.pid,
                        name = %target.name,
                        signal = ?step.signal,
                        "Signalling process"
                    );
                    if let Err(e) = self.processes.signal_pid(target.pid, step.signal) {
                        warn!(pid = target.pid, error = %e, "Signal failed");
                    }
                }
            }
            TargetSelector::Names => {
                for name in names {
                    info!(name = %name, signal = ?step.signal, "Signalling processes by name");
                    if let Err(e) = self.processes.signal_name(name, step.signal) {
                        warn!(name = %name, error = %e, "Signal failed");
                    }
                }
            }
        }
    }
}
