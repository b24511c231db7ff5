//! vmctl core library
//!
//! Control plane for the VMs of a single hypervisor host: lifecycle
//! operations, bulk operations over VM groups, and per-VM stats with rates
//! derived from cumulative hypervisor counters.

pub mod bulk;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod guest;
pub mod lifecycle;
pub mod observability;
pub mod paths;
pub mod provision;
pub mod sampling;

// Re-export commonly used items
pub use bulk::{BulkCoordinator, BulkOperation, BulkReport, Targets};
pub use config::Config;
pub use driver::{DriverFactory, HypervisorDriver, InMemoryDriver, VmHandle};
pub use error::{ErrorKind, Result, VmctlError};
pub use lifecycle::{CreateSpec, VmLifecycle};
pub use observability::{
    health::HealthChecker, init as init_observability, shutdown as shutdown_observability,
};
pub use provision::{DiskProvisioner, ProvisionMode, QemuImgProvisioner};
pub use sampling::{InMemorySampleStore, StatsCollector, StatsSnapshot};
