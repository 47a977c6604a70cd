//! Process table backed by `/proc`.

use crate::error::{Result, SwapError};
use crate::evict::{ProcessTable, SignalKind};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Default procfs mount point.
pub const PROC_ROOT: &str = "/proc";

/// [`ProcessTable`] that scans `/proc/<pid>/fd` and `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new(PROC_ROOT)
    }
}

impl Procfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// All numeric entries of the proc root, excluding this process.
    fn pids(&self) -> Result<Vec<u32>> {
        let own = std::process::id();
        let entries = fs::read_dir(&self.root).map_err(|e| SwapError::io(&self.root, e))?;
        let mut pids: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .filter(|pid| *pid != own)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn holds_any(&self, pid: u32, nodes: &BTreeSet<PathBuf>) -> bool {
        let proc_dir = self.root.join(pid.to_string());
        holds_via_fd(&proc_dir, nodes) || holds_via_maps(&proc_dir, nodes)
    }
}

/// Any open descriptor pointing at one of the nodes.
fn holds_via_fd(proc_dir: &Path, nodes: &BTreeSet<PathBuf>) -> bool {
    // Unreadable fd tables (other users, exited processes) are skipped.
    let Ok(entries) = fs::read_dir(proc_dir.join("fd")) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| fs::read_link(e.path()).ok())
        .any(|target| nodes.contains(&target))
}

/// Any memory mapping of one of the nodes.
fn holds_via_maps(proc_dir: &Path, nodes: &BTreeSet<PathBuf>) -> bool {
    let Ok(maps) = fs::read_to_string(proc_dir.join("maps")) else {
        return false;
    };
    maps.lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .any(|path| nodes.contains(Path::new(path)))
}

fn to_nix(signal: SignalKind) -> Signal {
    match signal {
        SignalKind::Terminate => Signal::SIGTERM,
        SignalKind::Kill => Signal::SIGKILL,
    }
}

impl ProcessTable for Procfs {
    fn holders(&self, nodes: &BTreeSet<PathBuf>) -> Result<Vec<u32>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let holders: Vec<u32> =
            self.pids()?.into_iter().filter(|pid| self.holds_any(*pid, nodes)).collect();
        trace!(holders = ?holders, "Scanned device holders");
        Ok(holders)
    }

    fn name(&self, pid: u32) -> Option<String> {
        fs::read_to_string(self.root.join(pid.to_string()).join("comm"))
            .ok()
            .map(|s| s.trim_end_matches('\n').to_string())
            .filter(|s| !s.is_empty())
    }

    fn signal_pid(&self, pid: u32, signal: SignalKind) -> Result<()> {
        let raw = i32::try_from(pid).map_err(SwapError::internal)?;
        match kill(Pid::from_raw(raw), to_nix(signal)) {
            // Already exited
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SwapError::Internal(format!("kill({pid}, {signal:?}) failed: {e}"))),
        }
    }

    fn signal_name(&self, name: &str, signal: SignalKind) -> Result<usize> {
        let matching: Vec<u32> = self
            .pids()?
            .into_iter()
            .filter(|pid| self.name(*pid).as_deref() == Some(name))
            .collect();
        signal_each(&matching, name, signal, |pid| self.signal_pid(pid, signal))
    }
}

/// Signal every pid even if some fail. Returns the number signalled, or the
/// first failure once all pids have been tried.
fn signal_each(
    pids: &[u32],
    name: &str,
    signal: SignalKind,
    mut send: impl FnMut(u32) -> Result<()>,
) -> Result<usize> {
    let mut signalled = 0;
    let mut first_error = None;
    for &pid in pids {
        debug!(pid, name = %name, signal = ?signal, "Signalling process by name");
        match send(pid) {
            Ok(()) => signalled += 1,
            Err(e) => {
                warn!(pid, name = %name, error = %e, "Signal failed; continuing");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => {
            let failed = pids.len() - signalled;
            debug!(name = %name, signalled, failed, "Signal by name incomplete");
            Err(e)
        }
        None => Ok(signalled),
    }
}
