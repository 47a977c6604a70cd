//! PCI device registry backed by sysfs.

use crate::error::{Result, SwapError};
use crate::vfio::address::PciAddress;
use crate::vfio::vendor::{self, Vendor};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default sysfs mount point.
pub const SYSFS_ROOT: &str = "/sys";

/// Default device node root.
pub const DEV_ROOT: &str = "/dev";

/// Snapshot of a PCI device, read fresh on every query.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub address: PciAddress,
    /// Vendor ID (e.g., "10de" for NVIDIA)
    pub vendor_id: String,
    /// Device ID (e.g., "2204" for RTX 3090)
    pub device_id: String,
    pub vendor: Vendor,
    /// Current driver (None if unbound)
    pub driver: Option<String>,
    pub iommu_group: Option<String>,
    /// Is this the boot VGA device?
    pub is_boot_vga: bool,
    /// User-space handles through which processes can hold the device
    pub nodes: BTreeSet<PathBuf>,
}

impl DeviceDescriptor {
    /// Get a human-readable device name.
    pub fn display_name(&self) -> String {
        format!("{} [{}:{}]", self.vendor, self.vendor_id, self.device_id)
    }
}

/// Read-only view of the PCI bus under a sysfs root.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(SYSFS_ROOT, DEV_ROOT)
    }
}

impl DeviceRegistry {
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into(), dev_root: dev_root.into() }
    }

    pub fn dev_root(&self) -> &Path {
        &self.dev_root
    }

    /// `/sys/bus/pci/devices/<address>`
    pub fn device_path(&self, address: &PciAddress) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(address.as_str())
    }

    /// `/sys/bus/pci/drivers/<driver>`
    pub fn driver_path(&self, driver: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/drivers").join(driver)
    }

    /// `/sys/bus/pci/drivers_probe`
    pub fn probe_path(&self) -> PathBuf {
        self.sysfs_root.join("bus/pci/drivers_probe")
    }

    pub fn exists(&self, address: &PciAddress) -> bool {
        self.device_path(address).exists()
    }

    /// Confirm the device exists and read its current state.
    pub fn resolve(&self, address: &PciAddress) -> Result<DeviceDescriptor> {
        let sysfs_path = self.device_path(address);
        if !sysfs_path.exists() {
            return Err(SwapError::DeviceNotFound { address: address.to_string() });
        }

        let vendor_id = read_hex_id(&sysfs_path.join("vendor"))?;
        let device_id = read_hex_id(&sysfs_path.join("device")).unwrap_or_default();
        let vendor = vendor::classify(&vendor_id);
        let driver = self.current_driver(address);
        let iommu_group = link_name(&sysfs_path.join("iommu_group"));
        let is_boot_vga = fs::read_to_string(sysfs_path.join("boot_vga"))
            .is_ok_and(|s| s.trim() == "1");
        let nodes = vendor::device_nodes(self, vendor, address);

        debug!(
            address = %address,
            vendor = %vendor,
            driver = ?driver,
            iommu_group = ?iommu_group,
            nodes = nodes.len(),
            "Read PCI device info"
        );

        Ok(DeviceDescriptor {
            address: address.clone(),
            vendor_id,
            device_id,
            vendor,
            driver,
            iommu_group,
            is_boot_vga,
            nodes,
        })
    }

    /// Name of the driver the device's `driver` link points at.
    pub fn current_driver(&self, address: &PciAddress) -> Option<String> {
        link_name(&self.device_path(address).join("driver"))
    }

    pub fn iommu_group(&self, address: &PciAddress) -> Option<String> {
        link_name(&self.device_path(address).join("iommu_group"))
    }

    /// Entries of the device's `drm/` directory (card0, renderD128, ...).
    pub fn drm_entries(&self, address: &PciAddress) -> Vec<String> {
        let drm = self.device_path(address).join("drm");
        let Ok(entries) = fs::read_dir(&drm) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

/// Read a `0x`-prefixed sysfs id file as lower-case hex without prefix.
fn read_hex_id(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().trim_start_matches("0x").to_lowercase())
        .map_err(|e| SwapError::io(path, e))
}

/// Final path component of a symlink target.
fn link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}
