//! Driver factory for hypervisor selection.
//!
//! The factory maps the configured driver name to an implementation, with
//! helpful error messages when a driver was not compiled in.

use crate::config::Config;
use crate::driver::{HypervisorDriver, InMemoryDriver};
use crate::error::{Result, VmctlError};
use std::sync::Arc;
use tracing::{info, instrument};

/// Factory for creating hypervisor drivers.
pub struct DriverFactory;

impl DriverFactory {
    /// Create the driver named by `config.driver`.
    ///
    /// - `"libvirt"` → `LibvirtDriver` connected to `config.libvirt_uri`
    ///   (requires the `libvirt` feature)
    /// - `"memory"` → `InMemoryDriver`, an empty in-process hypervisor
    ///
    /// # Errors
    ///
    /// Returns error if the name is unknown, the driver was not compiled in,
    /// or the hypervisor connection cannot be opened.
    #[instrument(skip(config), fields(driver = %config.driver))]
    pub fn create(config: &Config) -> Result<Arc<dyn HypervisorDriver>> {
        match config.driver.as_str() {
            "libvirt" => Self::create_libvirt(config),
            "memory" => {
                info!("Using in-memory hypervisor driver");
                Ok(Arc::new(InMemoryDriver::new()))
            }
            other => Err(VmctlError::InvalidConfig {
                reason: format!("Unknown driver '{}'. Valid options: libvirt, memory", other),
            }),
        }
    }

    #[cfg(feature = "libvirt")]
    fn create_libvirt(config: &Config) -> Result<Arc<dyn HypervisorDriver>> {
        let driver = crate::driver::LibvirtDriver::connect(&config.libvirt_uri)?;
        info!(uri = %config.libvirt_uri, "Connected to libvirt");
        Ok(Arc::new(driver))
    }

    #[cfg(not(feature = "libvirt"))]
    fn create_libvirt(_config: &Config) -> Result<Arc<dyn HypervisorDriver>> {
        Err(VmctlError::InvalidConfig {
            reason: "libvirt driver requires --features libvirt".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_driver() {
        let config = Config { driver: "memory".to_string(), ..Config::default() };
        let driver = DriverFactory::create(&config).unwrap();
        assert_eq!(driver.name(), "memory");
    }

    #[test]
    fn test_unknown_driver() {
        let config = Config { driver: "xen".to_string(), ..Config::default() };
        match DriverFactory::create(&config) {
            Err(VmctlError::InvalidConfig { reason }) => assert!(reason.contains("Unknown driver")),
            other => panic!("Expected InvalidConfig error, got {:?}", other.map(|d| d.name().to_string())),
        }
    }

    #[test]
    #[cfg(not(feature = "libvirt"))]
    fn test_libvirt_requires_feature_flag() {
        let config = Config { driver: "libvirt".to_string(), ..Config::default() };
        match DriverFactory::create(&config) {
            Err(VmctlError::InvalidConfig { reason }) => assert!(reason.contains("feature")),
            _ => panic!("Expected InvalidConfig error about feature flag"),
        }
    }
}
