//! gpuswap core library
//!
//! Hands PCI devices (GPUs and their companion functions) between host
//! drivers and vfio-pci on a running machine, with a persisted ledger of the
//! original bindings so every transfer can be reversed.

pub mod config;
pub mod context;
pub mod error;
pub mod evict;
pub mod ledger;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod retry;
pub mod service;
pub mod vfio;

// Re-export commonly used items
pub use config::Config;
pub use context::{CancelFlag, ExecutionContext};
pub use error::{Result, SwapError};
pub use ledger::{TransferLedger, TransferRecord};
pub use observability::init as init_observability;
pub use orchestrator::{ExitStatus, Orchestrator, Policies, Settings};
pub use retry::RetryPolicy;
pub use vfio::{PciAddress, Vendor};
