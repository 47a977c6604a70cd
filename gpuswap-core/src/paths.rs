//! Centralized path configuration for gpuswap.
//!
//! Config and ledger locations go through this module so the CLI and tests
//! agree on them, whether running as root or as a user.

use std::path::PathBuf;

/// System-wide config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/gpuswap/config.json";

/// System state directory used when running as root.
pub const SYSTEM_STATE_DIR: &str = "/var/lib/gpuswap";

/// Ledger file name inside the state directory.
pub const LEDGER_FILE: &str = "ledger";

/// Get the config file path.
///
/// Resolution order:
/// 1. `GPUSWAP_CONFIG` environment variable
/// 2. `/etc/gpuswap/config.json` if it exists
/// 3. `~/.config/gpuswap/config.json`
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GPUSWAP_CONFIG") {
        return PathBuf::from(path);
    }

    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        return system;
    }

    dirs::config_dir().map(|d| d.join("gpuswap").join("config.json")).unwrap_or(system)
}

/// Get the state directory holding the ledger.
///
/// Resolution order:
/// 1. `GPUSWAP_STATE_DIR` environment variable
/// 2. `/var/lib/gpuswap` if running as root
/// 3. `~/.local/share/gpuswap`
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GPUSWAP_STATE_DIR") {
        return PathBuf::from(dir);
    }

    let system = PathBuf::from(SYSTEM_STATE_DIR);
    if nix::unistd::geteuid().is_root() {
        return system;
    }

    dirs::data_dir().map(|d| d.join("gpuswap")).unwrap_or(system)
}

/// Get the default ledger path.
pub fn ledger_path() -> PathBuf {
    state_dir().join(LEDGER_FILE)
}
