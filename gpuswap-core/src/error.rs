//! Error types for gpuswap.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for gpuswap operations.
pub type Result<T> = std::result::Result<T, SwapError>;

/// Main error type for gpuswap.
#[derive(Error, Debug)]
pub enum SwapError {
    // Device lookup errors
    #[error("Invalid PCI address: {address} (expected 0000:01:00.0 or 01:00.0)")]
    InvalidAddress { address: String },

    #[error("PCI device not found: {address}")]
    DeviceNotFound { address: String },

    // Ledger errors
    #[error("Refusing to use ledger {path:?}: path is a symlink")]
    LedgerSymlink { path: PathBuf },

    #[error("Devices are already in isolation mode (ledger {path:?} is not empty). Use --force to override")]
    AlreadyIsolated { path: PathBuf },

    #[error("Nothing to restore: ledger {path:?} is missing or empty")]
    NothingToRestore { path: PathBuf },

    // Eviction errors
    #[error("Display server or session process holds the device: {processes:?}. Switch to a text console or stop your session first")]
    DisplayServerHolder { processes: Vec<String> },

    #[error("Process termination not confirmed by operator")]
    ConsentRefused,

    #[error("Device nodes still held after escalation: {holders:?}")]
    HoldersRemain { holders: Vec<String> },

    // Rebind errors
    #[error("Driver {driver} not available. {hint}")]
    DriverUnavailable { driver: String, hint: String },

    #[error("Failed to rebind {address}: {reason}")]
    RebindFailed { address: String, reason: String },

    #[error("Device {address} bound to {actual} instead of {expected}")]
    WrongDriver { address: String, expected: String, actual: String },

    #[error("Release incomplete, devices still need attention: {devices:?}")]
    ReleaseIncomplete { devices: Vec<String> },

    #[error("VFIO group node {path:?} not found for device {address}")]
    GroupNodeMissing { address: String, path: PathBuf },

    #[error("Unknown consumer identity: {name}")]
    UnknownIdentity { name: String },

    #[error("Operation cancelled")]
    Cancelled,

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SwapError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }

    /// Whether this error came out of the eviction safety protocol.
    pub fn is_eviction_abort(&self) -> bool {
        matches!(
            self,
            Self::DisplayServerHolder { .. } | Self::ConsentRefused | Self::HoldersRemain { .. }
        )
    }
}
