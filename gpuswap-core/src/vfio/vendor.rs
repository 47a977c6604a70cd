//! Vendor classification and device-node discovery.
//!
//! Each vendor maps to one [`VendorProfile`] entry. Adding a vendor is a new
//! table row, not a new branch.

use crate::vfio::address::PciAddress;
use crate::vfio::device::DeviceRegistry;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Known GPU vendor IDs.
pub mod code {
    pub const NVIDIA: &str = "10de";
    pub const AMD: &str = "1002";
    pub const INTEL: &str = "8086";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Unknown,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Vendor::Nvidia => "NVIDIA",
            Vendor::Amd => "AMD",
            Vendor::Intel => "Intel",
            Vendor::Unknown => "Unknown",
        })
    }
}

/// How user-space handles for a vendor's devices are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStrategy {
    /// Every entry in the dev root whose name starts with the prefix,
    /// regardless of which device it belongs to.
    GlobalPrefix(&'static str),
    /// The device's own DRM nodes, found through its sysfs `drm/` index.
    PerDeviceDrm,
}

#[derive(Debug, Clone, Copy)]
pub struct VendorProfile {
    pub vendor: Vendor,
    pub code: &'static str,
    pub driver: Option<&'static str>,
    pub nodes: NodeStrategy,
}

pub const VENDOR_TABLE: &[VendorProfile] = &[
    VendorProfile {
        vendor: Vendor::Nvidia,
        code: code::NVIDIA,
        driver: Some("nvidia"),
        nodes: NodeStrategy::GlobalPrefix("nvidia"),
    },
    VendorProfile {
        vendor: Vendor::Amd,
        code: code::AMD,
        driver: Some("amdgpu"),
        nodes: NodeStrategy::PerDeviceDrm,
    },
    VendorProfile {
        vendor: Vendor::Intel,
        code: code::INTEL,
        driver: Some("i915"),
        nodes: NodeStrategy::PerDeviceDrm,
    },
];

const UNKNOWN_PROFILE: VendorProfile = VendorProfile {
    vendor: Vendor::Unknown,
    code: "",
    driver: None,
    nodes: NodeStrategy::PerDeviceDrm,
};

pub fn profile(vendor: Vendor) -> &'static VendorProfile {
    VENDOR_TABLE.iter().find(|p| p.vendor == vendor).unwrap_or(&UNKNOWN_PROFILE)
}

/// Map a PCI vendor code (with or without `0x`) to a vendor category.
pub fn classify(vendor_id: &str) -> Vendor {
    let id = vendor_id.trim().trim_start_matches("0x").to_ascii_lowercase();
    VENDOR_TABLE.iter().find(|p| p.code == id).map_or(Vendor::Unknown, |p| p.vendor)
}

/// Host driver usually bound to this vendor's GPUs. Only used in log messages.
pub fn expected_driver(vendor: Vendor) -> Option<&'static str> {
    profile(vendor).driver
}

/// User-space handles through which processes can hold the device.
pub fn device_nodes(
    registry: &DeviceRegistry,
    vendor: Vendor,
    address: &PciAddress,
) -> BTreeSet<PathBuf> {
    let nodes: BTreeSet<PathBuf> = match profile(vendor).nodes {
        NodeStrategy::GlobalPrefix(prefix) => match fs::read_dir(registry.dev_root()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
                .filter(|e| e.file_type().is_ok_and(|t| !t.is_dir()))
                .map(|e| e.path())
                .collect(),
            Err(_) => BTreeSet::new(),
        },
        NodeStrategy::PerDeviceDrm => registry
            .drm_entries(address)
            .into_iter()
            .filter(|name| name.starts_with("card") || name.starts_with("renderD"))
            .map(|name| registry.dev_root().join("dri").join(name))
            .filter(|path| path.exists())
            .collect(),
    };

    debug!(address = %address, vendor = %vendor, nodes = ?nodes, "Discovered device nodes");
    nodes
}
