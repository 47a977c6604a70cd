//! Companion service restarts.

use crate::context::ExecutionContext;
use crate::error::{Result, SwapError};
use std::process::Command;
use tracing::{info, warn};

/// Restarts an external service if it is installed.
pub trait ServiceManager {
    /// Returns `Ok(false)` when the service does not exist.
    fn restart_if_present(&self, service: &str) -> Result<bool>;
}

/// [`ServiceManager`] backed by `systemctl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Systemd;

impl ServiceManager for Systemd {
    fn restart_if_present(&self, service: &str) -> Result<bool> {
        let present = Command::new("systemctl")
            .args(["cat", "--", service])
            .output()
            .map_err(|e| SwapError::Internal(format!("Failed to run systemctl: {}", e)))?
            .status
            .success();
        if !present {
            return Ok(false);
        }

        let status = Command::new("systemctl")
            .args(["restart", "--", service])
            .status()
            .map_err(|e| SwapError::Internal(format!("Failed to run systemctl: {}", e)))?;
        if !status.success() {
            return Err(SwapError::Internal(format!(
                "systemctl restart {} exited with {}",
                service, status
            )));
        }
        Ok(true)
    }
}

/// Restart `service` if configured. Failures are warnings only.
pub fn restart_companion(
    services: &dyn ServiceManager,
    service: Option<&str>,
    ctx: &ExecutionContext,
) {
    let Some(service) = service else {
        return;
    };
    if ctx.dry_run {
        info!(service = %service, "[dry-run] Would restart companion service");
        return;
    }
    match services.restart_if_present(service) {
        Ok(true) => info!(service = %service, "Restarted companion service"),
        Ok(false) => info!(service = %service, "Companion service not installed; skipping"),
        Err(e) => warn!(service = %service, error = %e, "Failed to restart companion service"),
    }
}
