//! libvirt hypervisor driver.
//!
//! Wraps a single shared `virt::connect::Connect`. libvirt calls block, so
//! every call runs on tokio's blocking pool. A libvirt connection is safe to
//! use from several threads at once, so calls on different VMs proceed in
//! parallel and a hung guest-agent query only occupies its own thread.

use crate::driver::{
    AddressSource, ByteCounters, GuestInterface, HypervisorDriver, IpAddress, MemoryStats,
    VmHandle,
};
use crate::error::{Result, VmctlError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::sys;

/// libvirt-backed `HypervisorDriver`.
pub struct LibvirtDriver {
    uri: String,
    conn: Arc<Connect>,
}

impl LibvirtDriver {
    /// Open a connection to the hypervisor at `uri` (e.g. `qemu:///system`).
    #[instrument]
    pub fn connect(uri: &str) -> Result<Self> {
        let conn = Connect::open(Some(uri)).map_err(|e| VmctlError::ConnectionFailed {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { uri: uri.to_string(), conn: Arc::new(conn) })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Run a blocking libvirt call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connect) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn))
        .await
        .map_err(VmctlError::internal)?
    }

    /// Run a blocking call against the domain named by `handle`.
    async fn with_domain<T, F>(&self, handle: &VmHandle, f: F) -> Result<T>
    where
        F: FnOnce(&Domain, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let name = handle.name.clone();
        self.blocking(move |conn| {
            let domain = lookup(conn, &name)?;
            f(&domain, &name)
        })
        .await
    }
}

fn lookup(conn: &Connect, name: &str) -> Result<Domain> {
    Domain::lookup_by_name(conn, name).map_err(|e| {
        if e.code() == ErrorNumber::NoDomain {
            VmctlError::VmNotFound { vm_name: name.to_string() }
        } else {
            VmctlError::driver(name, e.to_string())
        }
    })
}

fn driver_err(name: &str) -> impl FnOnce(virt::error::Error) -> VmctlError + '_ {
    move |e| VmctlError::driver(name, e.to_string())
}

#[async_trait]
impl HypervisorDriver for LibvirtDriver {
    async fn lookup_by_name(&self, name: &str) -> Result<VmHandle> {
        let name = name.to_string();
        self.blocking(move |conn| lookup(conn, &name).map(|_| VmHandle::new(name.clone()))).await
    }

    async fn define_from_descriptor(&self, descriptor: &str) -> Result<VmHandle> {
        let descriptor = descriptor.to_string();
        self.blocking(move |conn| {
            let domain = Domain::define_xml(conn, &descriptor)
                .map_err(|e| VmctlError::InvalidDescriptor { reason: e.to_string() })?;
            let name = domain
                .get_name()
                .map_err(|e| VmctlError::Driver { vm_name: None, reason: e.to_string() })?;
            debug!(vm_name = %name, "Defined domain");
            Ok(VmHandle::new(name))
        })
        .await
    }

    async fn start(&self, handle: &VmHandle) -> Result<()> {
        self.with_domain(handle, |domain, name| {
            domain.create().map(|_| ()).map_err(driver_err(name))
        })
        .await
    }

    async fn stop(&self, handle: &VmHandle) -> Result<()> {
        self.with_domain(handle, |domain, name| domain.destroy().map_err(driver_err(name))).await
    }

    async fn undefine(&self, handle: &VmHandle) -> Result<()> {
        self.with_domain(handle, |domain, name| domain.undefine().map_err(driver_err(name))).await
    }

    async fn is_active(&self, handle: &VmHandle) -> Result<bool> {
        self.with_domain(handle, |domain, name| domain.is_active().map_err(driver_err(name)))
            .await
    }

    async fn cpu_stats(&self, handle: &VmHandle) -> Result<u64> {
        self.with_domain(handle, |domain, name| {
            let info = domain.get_info().map_err(driver_err(name))?;
            Ok(info.cpu_time)
        })
        .await
    }

    async fn memory_stats(&self, handle: &VmHandle) -> Result<MemoryStats> {
        self.with_domain(handle, |domain, name| {
            let info = domain.get_info().map_err(driver_err(name))?;
            let rss_kib = domain
                .memory_stats(0)
                .map_err(driver_err(name))?
                .iter()
                .find(|stat| stat.tag == sys::VIR_DOMAIN_MEMORY_STAT_RSS as u32)
                .map(|stat| stat.val)
                .unwrap_or(0);
            Ok(MemoryStats { rss_kib, max_kib: info.max_mem })
        })
        .await
    }

    async fn interface_addresses(
        &self,
        handle: &VmHandle,
        source: AddressSource,
    ) -> Result<Vec<GuestInterface>> {
        let source_flag = match source {
            AddressSource::Agent => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT,
            AddressSource::Lease => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
        };
        self.with_domain(handle, move |domain, name| {
            let interfaces =
                domain.interface_addresses(source_flag as u32, 0).map_err(driver_err(name))?;
            Ok(interfaces
                .into_iter()
                .map(|iface| GuestInterface {
                    name: iface.name,
                    hwaddr: Some(iface.hwaddr).filter(|mac| !mac.is_empty()),
                    addresses: iface
                        .addrs
                        .into_iter()
                        .map(|a| IpAddress { addr: a.addr, prefix: a.prefix })
                        .collect(),
                })
                .collect())
        })
        .await
    }

    async fn interface_byte_counters(
        &self,
        handle: &VmHandle,
        target: &str,
    ) -> Result<ByteCounters> {
        let target = target.to_string();
        self.with_domain(handle, move |domain, name| {
            let stats = domain.interface_stats(&target).map_err(driver_err(name))?;
            Ok(ByteCounters {
                rx_bytes: stats.rx_bytes.max(0) as u64,
                tx_bytes: stats.tx_bytes.max(0) as u64,
            })
        })
        .await
    }

    async fn list_active_names(&self) -> Result<Vec<String>> {
        self.blocking(|conn| {
            let domains = conn
                .list_all_domains(sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE)
                .map_err(|e| VmctlError::Driver { vm_name: None, reason: e.to_string() })?;
            domains
                .iter()
                .map(|d| {
                    d.get_name().map_err(|e| VmctlError::Driver { vm_name: None, reason: e.to_string() })
                })
                .collect()
        })
        .await
    }

    async fn list_defined_names(&self) -> Result<Vec<String>> {
        self.blocking(|conn| {
            conn.list_defined_domains()
                .map_err(|e| VmctlError::Driver { vm_name: None, reason: e.to_string() })
        })
        .await
    }

    fn name(&self) -> &str {
        "libvirt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// libvirt's built-in test hypervisor: no daemon, one running domain named "test".
    const TEST_URI: &str = "test:///default";

    #[test]
    fn test_driver_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LibvirtDriver>();
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_connection() {
        let driver = Arc::new(LibvirtDriver::connect(TEST_URI).unwrap());
        let handle = driver.lookup_by_name("test").await.unwrap();

        let calls: Vec<_> = (0..16)
            .map(|_| {
                let driver = driver.clone();
                let handle = handle.clone();
                tokio::spawn(async move { driver.is_active(&handle).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().unwrap());
        }
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let driver = LibvirtDriver::connect(TEST_URI).unwrap();
        let err = driver.lookup_by_name("ghost").await.unwrap_err();
        assert!(matches!(err, VmctlError::VmNotFound { .. }));
    }
}
