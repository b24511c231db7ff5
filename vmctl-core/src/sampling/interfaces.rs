//! Network interface discovery for a running VM.

use crate::driver::{AddressSource, GuestInterface, HypervisorDriver, IpAddress, VmHandle};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

const LOOPBACK: &str = "lo";

/// An interface worth sampling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub hwaddr: Option<String>,
    pub addresses: Vec<IpAddress>,
    pub source: AddressSource,
}

impl InterfaceDescriptor {
    fn from_guest(iface: GuestInterface, source: AddressSource) -> Self {
        Self { name: iface.name, hwaddr: iface.hwaddr, addresses: iface.addresses, source }
    }

    /// Identifier the driver's byte-counter query understands.
    ///
    /// Lease entries already carry the host-side device name. Agent entries
    /// carry the guest-side name, which the host does not know, so the MAC is
    /// used instead and `fallback` only when no MAC was reported.
    pub fn counter_target(&self, fallback: &str) -> String {
        match (self.source, &self.hwaddr) {
            (AddressSource::Lease, _) => self.name.clone(),
            (AddressSource::Agent, Some(mac)) if !mac.is_empty() => mac.clone(),
            (AddressSource::Agent, _) => fallback.to_string(),
        }
    }
}

/// Resolves the interfaces of a VM, guest agent first, DHCP leases second.
#[derive(Clone)]
pub struct InterfaceResolver {
    driver: Arc<dyn HypervisorDriver>,
    fallback_interface: String,
}

impl InterfaceResolver {
    pub fn new(driver: Arc<dyn HypervisorDriver>, fallback_interface: impl Into<String>) -> Self {
        Self { driver, fallback_interface: fallback_interface.into() }
    }

    pub fn fallback_interface(&self) -> &str {
        &self.fallback_interface
    }

    /// Interfaces with at least one address, loopback excluded.
    ///
    /// An empty result is not an error: the guest may simply have no agent
    /// and no lease yet.
    pub async fn resolve_interfaces(&self, handle: &VmHandle) -> Vec<InterfaceDescriptor> {
        for source in [AddressSource::Agent, AddressSource::Lease] {
            let interfaces = self.query(handle, source).await;
            if !interfaces.is_empty() {
                debug!(vm_name = %handle.name, %source, count = interfaces.len(), "Resolved interfaces");
                return interfaces;
            }
        }
        debug!(vm_name = %handle.name, "No network interfaces found");
        Vec::new()
    }

    async fn query(&self, handle: &VmHandle, source: AddressSource) -> Vec<InterfaceDescriptor> {
        match self.driver.interface_addresses(handle, source).await {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|iface| iface.name != LOOPBACK && !iface.addresses.is_empty())
                .map(|iface| InterfaceDescriptor::from_guest(iface, source))
                .collect(),
            Err(e) => {
                warn!(vm_name = %handle.name, %source, error = %e, "Interface address query failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverOp, InMemoryDriver};

    fn iface(name: &str, mac: Option<&str>, addrs: &[&str]) -> GuestInterface {
        GuestInterface {
            name: name.to_string(),
            hwaddr: mac.map(str::to_string),
            addresses: addrs.iter().map(|a| IpAddress { addr: a.to_string(), prefix: 24 }).collect(),
        }
    }

    fn setup() -> (Arc<InMemoryDriver>, InterfaceResolver) {
        let driver = Arc::new(InMemoryDriver::new());
        driver.add_vm("web_1", true);
        let resolver = InterfaceResolver::new(driver.clone(), "vnet0");
        (driver, resolver)
    }

    #[tokio::test]
    async fn test_agent_source_preferred() {
        let (driver, resolver) = setup();
        driver.set_interfaces(
            "web_1",
            AddressSource::Agent,
            vec![iface("lo", None, &["127.0.0.1"]), iface("eth0", Some("52:54:00:aa:bb:cc"), &["10.0.0.5"])],
        );
        driver.set_interfaces("web_1", AddressSource::Lease, vec![iface("vnet3", None, &["10.0.0.5"])]);

        let resolved = resolver.resolve_interfaces(&VmHandle::new("web_1")).await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "eth0");
        assert_eq!(resolved[0].source, AddressSource::Agent);
    }

    #[tokio::test]
    async fn test_falls_back_to_leases() {
        let (driver, resolver) = setup();
        driver.set_interfaces("web_1", AddressSource::Lease, vec![iface("vnet2", None, &["192.168.122.40"])]);

        let resolved = resolver.resolve_interfaces(&VmHandle::new("web_1")).await;
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "vnet2");
        assert_eq!(resolved[0].source, AddressSource::Lease);
    }

    #[tokio::test]
    async fn test_agent_with_only_loopback_falls_back() {
        let (driver, resolver) = setup();
        driver.set_interfaces(
            "web_1",
            AddressSource::Agent,
            vec![iface("lo", None, &["127.0.0.1"]), iface("eth1", None, &[])],
        );
        driver.set_interfaces("web_1", AddressSource::Lease, vec![iface("vnet0", None, &["192.168.122.2"])]);

        let resolved = resolver.resolve_interfaces(&VmHandle::new("web_1")).await;
        assert_eq!(resolved.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), ["vnet0"]);
    }

    #[tokio::test]
    async fn test_query_failures_are_soft() {
        let (driver, resolver) = setup();
        driver.inject_failure("web_1", DriverOp::InterfaceAddresses, "guest agent is not responding");

        let resolved = resolver.resolve_interfaces(&VmHandle::new("web_1")).await;
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_counter_target() {
        let lease = InterfaceDescriptor::from_guest(iface("vnet4", Some("52:54:00:00:00:01"), &["10.0.0.1"]), AddressSource::Lease);
        assert_eq!(lease.counter_target("vnet0"), "vnet4");

        let agent = InterfaceDescriptor::from_guest(iface("eth0", Some("52:54:00:00:00:02"), &["10.0.0.2"]), AddressSource::Agent);
        assert_eq!(agent.counter_target("vnet0"), "52:54:00:00:00:02");

        let agent_no_mac = InterfaceDescriptor::from_guest(iface("eth0", None, &["10.0.0.3"]), AddressSource::Agent);
        assert_eq!(agent_no_mac.counter_target("vnet9"), "vnet9");
    }
}
