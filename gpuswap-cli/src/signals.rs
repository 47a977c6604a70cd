//! SIGINT/SIGTERM handling.
//!
//! The first signal sets the cancel flag and the orchestrator stops at its
//! next checkpoint. The handler resets itself, so a second signal kills the
//! process outright.

use anyhow::{Context, Result};
use gpuswap_core::CancelFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::OnceLock;

static CANCEL: OnceLock<CancelFlag> = OnceLock::new();

extern "C" fn on_signal(_: nix::libc::c_int) {
    if let Some(flag) = CANCEL.get() {
        flag.cancel();
    }
}

pub fn install(cancel: &CancelFlag) -> Result<()> {
    CANCEL.get_or_init(|| cancel.clone());

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only does an atomic store.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {} handler", signal))?;
    }
    Ok(())
}
