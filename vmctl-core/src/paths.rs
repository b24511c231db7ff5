//! Centralized path configuration for vmctl.
//!
//! All data paths should go through this module to ensure consistency
//! between the daemon and tooling, whether running as user or system service.

use std::path::PathBuf;

/// Get the vmctl data directory.
///
/// Resolution order:
/// 1. `VMCTL_DATA_DIR` environment variable
/// 2. `/var/lib/vmctl` if it exists (system install)
/// 3. `~/.vmctl` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VMCTL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/vmctl");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".vmctl")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `VMCTL_CONFIG_DIR` wins, otherwise `<config dir>/vmctl` (e.g. `~/.config/vmctl`).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VMCTL_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("vmctl")).unwrap_or_else(|| data_dir().join("config"))
}

/// Get the directory holding per-VM disk images.
pub fn images_dir() -> PathBuf {
    data_dir().join("images")
}
