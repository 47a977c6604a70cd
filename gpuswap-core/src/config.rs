//! Configuration management.

use crate::error::{Result, SwapError};
use crate::evict::{DEFAULT_CONSENT_TIMEOUT, PROC_ROOT};
use crate::paths;
use crate::vfio::device::{DEV_ROOT, SYSFS_ROOT};
use crate::vfio::{ConsumerIdentity, VFIO_PCI_DRIVER};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent configuration for gpuswap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Devices to move when none are given on the command line.
    pub devices: Vec<String>,
    /// Owner of the VFIO group nodes after acquire.
    pub consumer_user: Option<String>,
    /// Group of the VFIO group nodes after acquire.
    pub consumer_group: Option<String>,
    pub ledger_path: PathBuf,
    /// Service restarted after the devices are returned (e.g. nvidia-persistenced).
    pub companion_service: Option<String>,
    pub restart_service_on_acquire: bool,
    pub isolation_driver: String,
    pub consent_timeout_secs: u64,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            consumer_user: None,
            consumer_group: None,
            ledger_path: paths::ledger_path(),
            companion_service: None,
            restart_service_on_acquire: false,
            isolation_driver: VFIO_PCI_DRIVER.to_string(),
            consent_timeout_secs: DEFAULT_CONSENT_TIMEOUT.as_secs(),
            sysfs_root: PathBuf::from(SYSFS_ROOT),
            dev_root: PathBuf::from(DEV_ROOT),
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Load configuration from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| SwapError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| SwapError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.isolation_driver.is_empty() || self.isolation_driver.contains(',') {
            return Err(SwapError::InvalidConfig {
                reason: format!(
                    "isolation_driver {:?} is not a driver name",
                    self.isolation_driver
                ),
            });
        }
        Ok(())
    }

    pub fn consumer(&self) -> ConsumerIdentity {
        ConsumerIdentity { user: self.consumer_user.clone(), group: self.consumer_group.clone() }
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }
}
