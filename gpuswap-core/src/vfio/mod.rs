//! PCI device handoff between host drivers and vfio-pci.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Device handoff                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PciAddress      parse/normalize 0000:01:00.0 or 01:00.0    │
//! │  DeviceRegistry  read-only sysfs view (driver, group, drm)  │
//! │  vendor          vendor table -> device nodes, host driver  │
//! │  DeviceControl   unbind / override / bind / probe writes    │
//! │  RebindEngine    BoundTo -> Unbound -> BoundTo + polling    │
//! │  group           /dev/vfio/<group> ownership                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is Linux sysfs. The sysfs and /dev roots are parameters so
//! the whole pipeline can run against a fabricated tree.

pub mod address;
pub mod control;
pub mod device;
pub mod group;
pub mod rebind;
pub mod vendor;

pub use address::PciAddress;
pub use control::{DeviceControl, SysfsControl};
pub use device::{DeviceDescriptor, DeviceRegistry};
pub use group::ConsumerIdentity;
pub use rebind::{BindState, Direction, RebindEngine, RebindOutcome, RebindPolicy};
pub use vendor::Vendor;

/// VFIO-PCI driver name.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";
