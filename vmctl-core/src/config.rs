//! Configuration management.

use crate::error::{Result, VmctlError};
use crate::paths;
use crate::provision::ProvisionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent configuration for vmctl.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor driver: "libvirt" or "memory".
    pub driver: String,
    pub libvirt_uri: String,
    pub listen_addr: String,
    pub metrics_port: u16,
    pub image_dir: PathBuf,
    pub default_memory_mb: u32,
    pub default_vcpus: u32,
    pub default_disk_size_gb: u32,
    pub default_network: String,
    pub provision_mode: ProvisionMode,
    /// Upper bound on concurrent per-VM operations inside one bulk request.
    pub bulk_parallelism: usize,
    /// Byte-counter target used when an interface reports no usable identifier.
    pub fallback_interface: String,
    /// Upper bound on one stats request, enforced by the HTTP layer.
    pub stats_timeout_secs: u64,
    pub descriptor_template: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: default_driver().to_string(),
            libvirt_uri: "qemu:///system".to_string(),
            listen_addr: "127.0.0.1:5000".to_string(),
            metrics_port: 9464,
            image_dir: paths::images_dir(),
            default_memory_mb: 1024,
            default_vcpus: 2,
            default_disk_size_gb: 20,
            default_network: "default".to_string(),
            provision_mode: ProvisionMode::FullClone,
            bulk_parallelism: 4,
            fallback_interface: "vnet0".to_string(),
            stats_timeout_secs: 10,
            descriptor_template: None,
            log_level: "info".to_string(),
        }
    }
}

fn default_driver() -> &'static str {
    if cfg!(feature = "libvirt") {
        "libvirt"
    } else {
        "memory"
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from disk, then apply `VMCTL_*` environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file. A missing file yields defaults.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| VmctlError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| VmctlError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VmctlError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| VmctlError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| VmctlError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VMCTL_DRIVER") {
            self.driver = v;
        }
        if let Some(v) = lookup("VMCTL_LIBVIRT_URI") {
            self.libvirt_uri = v;
        }
        if let Some(v) = lookup("VMCTL_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("VMCTL_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VMCTL_BULK_PARALLELISM") {
            self.bulk_parallelism = v.parse().map_err(|_| VmctlError::InvalidConfig {
                reason: format!("VMCTL_BULK_PARALLELISM must be a positive integer, got '{}'", v),
            })?;
        }
        if let Some(v) = lookup("VMCTL_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bulk_parallelism == 0 {
            return Err(VmctlError::InvalidConfig {
                reason: "bulk_parallelism must be at least 1".to_string(),
            });
        }
        if self.stats_timeout_secs == 0 {
            return Err(VmctlError::InvalidConfig {
                reason: "stats_timeout_secs must be at least 1".to_string(),
            });
        }
        if self.libvirt_uri.trim().is_empty() {
            return Err(VmctlError::InvalidConfig {
                reason: "libvirt_uri must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Disk image location for a VM: `<image_dir>/<vm_name>.qcow2`.
    pub fn image_path(&self, vm_name: &str) -> PathBuf {
        self.image_dir.join(format!("{}.qcow2", vm_name))
    }
}
