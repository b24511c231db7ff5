//! Hypervisor driver abstraction.
//!
//! vmctl consumes a pre-existing virtualization driver through the
//! `HypervisorDriver` trait:
//! - `LibvirtDriver`: libvirt/QEMU-KVM (feature `libvirt`)
//! - `InMemoryDriver`: in-process model for development and tests
//!
//! VMs are addressed by name only; a `VmHandle` is proof that the name was
//! resolved by the driver at some point, not a lock on the VM.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Hypervisor driver trait.
///
/// Calls on independent VM names may run concurrently; implementations are
/// responsible for serializing access to their connection if they need to.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Resolve a VM by name. Fails with `VmNotFound` if no such VM is defined.
    async fn lookup_by_name(&self, name: &str) -> Result<VmHandle>;

    /// Register a persistent VM definition from a descriptor.
    async fn define_from_descriptor(&self, descriptor: &str) -> Result<VmHandle>;

    /// Boot a defined VM.
    async fn start(&self, handle: &VmHandle) -> Result<()>;

    /// Power off a running VM immediately.
    async fn stop(&self, handle: &VmHandle) -> Result<()>;

    /// Remove a VM definition. The VM should be stopped first.
    async fn undefine(&self, handle: &VmHandle) -> Result<()>;

    async fn is_active(&self, handle: &VmHandle) -> Result<bool>;

    /// Cumulative CPU time consumed by the running instance, in nanoseconds.
    async fn cpu_stats(&self, handle: &VmHandle) -> Result<u64>;

    async fn memory_stats(&self, handle: &VmHandle) -> Result<MemoryStats>;

    /// Interfaces and addresses as reported by one address source.
    async fn interface_addresses(
        &self,
        handle: &VmHandle,
        source: AddressSource,
    ) -> Result<Vec<GuestInterface>>;

    /// Cumulative RX/TX byte counters of one interface.
    ///
    /// `target` is either the host-side device name (e.g. `vnet0`) or the
    /// interface MAC address.
    async fn interface_byte_counters(&self, handle: &VmHandle, target: &str)
        -> Result<ByteCounters>;

    async fn list_active_names(&self) -> Result<Vec<String>>;

    /// Names of defined but inactive VMs.
    async fn list_defined_names(&self) -> Result<Vec<String>>;

    /// Get driver name (for logging/metrics).
    fn name(&self) -> &str;
}

/// Resolved reference to a VM known to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub name: String,
}

impl VmHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Where interface address information comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// The guest agent running inside the VM
    Agent,
    /// The host DHCP server's lease table
    Lease,
}

impl std::fmt::Display for AddressSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Lease => write!(f, "lease"),
        }
    }
}

/// One network interface as reported by an address source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInterface {
    /// Interface name. Guest-side (`eth0`) for the agent, host-side (`vnet0`) for leases.
    pub name: String,

    /// MAC address, if reported
    pub hwaddr: Option<String>,

    pub addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub addr: String,
    pub prefix: u32,
}

/// Memory residency of a running VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Resident set size of the VM process
    pub rss_kib: u64,

    /// Maximum memory the VM may use
    pub max_kib: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

mod factory;
mod memory;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use factory::DriverFactory;
pub use memory::{DriverOp, InMemoryDriver};

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDriver;
