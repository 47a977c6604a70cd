//! Writes against the PCI control interface.
//!
//! [`DeviceControl`] is the seam between the rebind state machine and the
//! kernel. [`SysfsControl`] is the real implementation; tests supply their own.

use crate::error::{Result, SwapError};
use crate::vfio::address::PciAddress;
use crate::vfio::device::DeviceRegistry;
use std::fs;
use std::io::ErrorKind;
use tracing::{debug, warn};

/// Driver-level operations on a single PCI device.
pub trait DeviceControl {
    /// Driver currently bound to the device, if any.
    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>>;

    /// Ask the bound driver to release the device.
    fn unbind(&self, address: &PciAddress) -> Result<()>;

    /// Set (`Some`) or clear (`None`) the `driver_override` hint.
    fn set_override(&self, address: &PciAddress, driver: Option<&str>) -> Result<()>;

    /// Direct bind request against a named driver.
    fn bind(&self, driver: &str, address: &PciAddress) -> Result<()>;

    /// Global re-probe scoped to one device.
    fn probe(&self, address: &PciAddress) -> Result<()>;

    /// Make sure a driver is loaded and registered on the PCI bus.
    fn load_driver(&self, driver: &str) -> Result<()>;

    /// Whether a driver is registered on the PCI bus.
    fn driver_available(&self, driver: &str) -> bool;
}

/// [`DeviceControl`] over sysfs.
#[derive(Debug, Clone, Default)]
pub struct SysfsControl {
    registry: DeviceRegistry,
}

impl SysfsControl {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    fn write(&self, path: std::path::PathBuf, value: &str) -> Result<()> {
        debug!(path = %path.display(), value = %value.trim(), "sysfs write");
        fs::write(&path, value).map_err(|e| SwapError::io(path, e))
    }
}

impl DeviceControl for SysfsControl {
    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>> {
        if !self.registry.exists(address) {
            return Err(SwapError::DeviceNotFound { address: address.to_string() });
        }
        Ok(self.registry.current_driver(address))
    }

    fn unbind(&self, address: &PciAddress) -> Result<()> {
        let unbind_path = self.registry.device_path(address).join("driver/unbind");
        match fs::write(&unbind_path, address.as_str()) {
            Ok(()) => Ok(()),
            // Driver link vanished between the read and the write.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(address = %address, "Device already unbound");
                Ok(())
            }
            Err(e) => Err(SwapError::io(unbind_path, e)),
        }
    }

    fn set_override(&self, address: &PciAddress, driver: Option<&str>) -> Result<()> {
        let path = self.registry.device_path(address).join("driver_override");
        // A lone newline clears the override.
        self.write(path, driver.unwrap_or("\n"))
    }

    fn bind(&self, driver: &str, address: &PciAddress) -> Result<()> {
        let bind_path = self.registry.driver_path(driver).join("bind");
        if !bind_path.exists() {
            return Err(SwapError::DriverUnavailable {
                driver: driver.to_string(),
                hint: format!("{} does not exist", bind_path.display()),
            });
        }
        self.write(bind_path, address.as_str())
    }

    fn probe(&self, address: &PciAddress) -> Result<()> {
        self.write(self.registry.probe_path(), address.as_str())
    }

    fn load_driver(&self, driver: &str) -> Result<()> {
        // No-op if already loaded
        match std::process::Command::new("modprobe").arg(driver).status() {
            Ok(status) if !status.success() => {
                warn!(driver = %driver, "modprobe returned non-zero (may be built in)");
            }
            Ok(_) => {}
            Err(e) => warn!(driver = %driver, error = %e, "Failed to run modprobe"),
        }

        if !self.driver_available(driver) {
            return Err(SwapError::DriverUnavailable {
                driver: driver.to_string(),
                hint: format!("Load it with: modprobe {}", driver),
            });
        }
        Ok(())
    }

    fn driver_available(&self, driver: &str) -> bool {
        self.registry.driver_path(driver).exists()
    }
}
