//! In-process hypervisor model.
//!
//! Keeps VM definitions, power state and counters in memory. Used when the
//! daemon runs with `driver = "memory"` and as the hypervisor in tests, where
//! counters, address tables, latency and failures are set from the outside.

use crate::descriptor;
use crate::driver::{
    AddressSource, ByteCounters, GuestInterface, HypervisorDriver, MemoryStats, VmHandle,
};
use crate::error::{Result, VmctlError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Driver operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Define,
    Start,
    Stop,
    Undefine,
    CpuStats,
    MemoryStats,
    InterfaceAddresses,
    ByteCounters,
}

#[derive(Debug, Default)]
struct VmRecord {
    active: bool,
    descriptor: String,
    cpu_time_ns: u64,
    memory: MemoryStats,
    agent_interfaces: Vec<GuestInterface>,
    lease_interfaces: Vec<GuestInterface>,
    counters: HashMap<String, ByteCounters>,
}

#[derive(Default)]
struct State {
    // Ordered so listings are deterministic
    vms: BTreeMap<String, VmRecord>,
    failures: HashMap<(String, DriverOp), String>,
}

/// In-memory `HypervisorDriver`.
pub struct InMemoryDriver {
    state: Mutex<State>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Define a VM directly, bypassing descriptors.
    pub fn add_vm(&self, name: &str, active: bool) {
        let record = VmRecord { active, ..VmRecord::default() };
        self.state().vms.insert(name.to_string(), record);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.state().vms.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state().vms.get(name).map(|vm| vm.active).unwrap_or(false)
    }

    /// The descriptor a VM was defined from, if it was defined through the driver API.
    pub fn descriptor(&self, name: &str) -> Option<String> {
        self.state()
            .vms
            .get(name)
            .map(|vm| vm.descriptor.clone())
            .filter(|descriptor| !descriptor.is_empty())
    }

    pub fn set_cpu_time(&self, name: &str, cpu_time_ns: u64) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.cpu_time_ns = cpu_time_ns;
        }
    }

    pub fn set_memory(&self, name: &str, rss_kib: u64, max_kib: u64) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.memory = MemoryStats { rss_kib, max_kib };
        }
    }

    pub fn set_interfaces(&self, name: &str, source: AddressSource, interfaces: Vec<GuestInterface>) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            match source {
                AddressSource::Agent => vm.agent_interfaces = interfaces,
                AddressSource::Lease => vm.lease_interfaces = interfaces,
            }
        }
    }

    pub fn set_byte_counters(&self, name: &str, target: &str, rx_bytes: u64, tx_bytes: u64) {
        if let Some(vm) = self.state().vms.get_mut(name) {
            vm.counters.insert(target.to_string(), ByteCounters { rx_bytes, tx_bytes });
        }
    }

    /// Make every future `op` on `name` fail with `reason` until cleared.
    pub fn inject_failure(&self, name: &str, op: DriverOp, reason: &str) {
        self.state().failures.insert((name.to_string(), op), reason.to_string());
    }

    pub fn clear_failure(&self, name: &str, op: DriverOp) {
        self.state().failures.remove(&(name.to_string(), op));
    }

    /// Delay every driver call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    /// Highest number of driver calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight { counter: &self.in_flight };

        let latency = *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn check_failure(state: &State, name: &str, op: DriverOp) -> Result<()> {
        match state.failures.get(&(name.to_string(), op)) {
            Some(reason) => Err(VmctlError::driver(name, reason.clone())),
            None => Ok(()),
        }
    }

    /// Run `f` against a VM record after failure injection checks.
    fn with_vm<T>(
        &self,
        name: &str,
        op: DriverOp,
        f: impl FnOnce(&mut VmRecord) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state();
        Self::check_failure(&state, name, op)?;
        let vm = state
            .vms
            .get_mut(name)
            .ok_or_else(|| VmctlError::VmNotFound { vm_name: name.to_string() })?;
        f(vm)
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn not_running(name: &str) -> VmctlError {
    VmctlError::driver(name, "domain is not running")
}

#[async_trait]
impl HypervisorDriver for InMemoryDriver {
    async fn lookup_by_name(&self, name: &str) -> Result<VmHandle> {
        let _guard = self.enter().await;
        if self.state().vms.contains_key(name) {
            Ok(VmHandle::new(name))
        } else {
            Err(VmctlError::VmNotFound { vm_name: name.to_string() })
        }
    }

    async fn define_from_descriptor(&self, descriptor: &str) -> Result<VmHandle> {
        let _guard = self.enter().await;
        let name = descriptor::domain_name(descriptor).ok_or_else(|| {
            VmctlError::InvalidDescriptor { reason: "descriptor has no <name> element".to_string() }
        })?;

        let mut state = self.state();
        Self::check_failure(&state, &name, DriverOp::Define)?;
        // Redefining an existing VM replaces its definition, like libvirt does
        let record = state.vms.entry(name.clone()).or_default();
        record.descriptor = descriptor.to_string();
        Ok(VmHandle::new(name))
    }

    async fn start(&self, handle: &VmHandle) -> Result<()> {
        let _guard = self.enter().await;
        self.with_vm(&handle.name, DriverOp::Start, |vm| {
            if vm.active {
                return Err(VmctlError::driver(&handle.name, "domain is already running"));
            }
            // A fresh instance starts its counters from zero
            vm.active = true;
            vm.cpu_time_ns = 0;
            for counters in vm.counters.values_mut() {
                *counters = ByteCounters::default();
            }
            Ok(())
        })
    }

    async fn stop(&self, handle: &VmHandle) -> Result<()> {
        let _guard = self.enter().await;
        self.with_vm(&handle.name, DriverOp::Stop, |vm| {
            if !vm.active {
                return Err(not_running(&handle.name));
            }
            vm.active = false;
            Ok(())
        })
    }

    async fn undefine(&self, handle: &VmHandle) -> Result<()> {
        let _guard = self.enter().await;
        let mut state = self.state();
        Self::check_failure(&state, &handle.name, DriverOp::Undefine)?;
        match state.vms.get(&handle.name) {
            None => Err(VmctlError::VmNotFound { vm_name: handle.name.clone() }),
            Some(vm) if vm.active => {
                Err(VmctlError::driver(&handle.name, "cannot undefine a running domain"))
            }
            Some(_) => {
                state.vms.remove(&handle.name);
                Ok(())
            }
        }
    }

    async fn is_active(&self, handle: &VmHandle) -> Result<bool> {
        let _guard = self.enter().await;
        self.state()
            .vms
            .get(&handle.name)
            .map(|vm| vm.active)
            .ok_or_else(|| VmctlError::VmNotFound { vm_name: handle.name.clone() })
    }

    async fn cpu_stats(&self, handle: &VmHandle) -> Result<u64> {
        let _guard = self.enter().await;
        self.with_vm(&handle.name, DriverOp::CpuStats, |vm| {
            if !vm.active {
                return Err(not_running(&handle.name));
            }
            Ok(vm.cpu_time_ns)
        })
    }

    async fn memory_stats(&self, handle: &VmHandle) -> Result<MemoryStats> {
        let _guard = self.enter().await;
        self.with_vm(&handle.name, DriverOp::MemoryStats, |vm| Ok(vm.memory))
    }

    async fn interface_addresses(
        &self,
        handle: &VmHandle,
        source: AddressSource,
    ) -> Result<Vec<GuestInterface>> {
        let _guard = self.enter().await;
        self.with_vm(&handle.name, DriverOp::InterfaceAddresses, |vm| {
            Ok(match source {
                AddressSource::Agent => vm.agent_interfaces.clone(),
                AddressSource::Lease => vm.lease_interfaces.clone(),
            })
        })
    }

    async fn interface_byte_counters(
        &self,
        handle: &VmHandle,
        target: &str,
    ) -> Result<ByteCounters> {
        let _guard = self.enter().await;
        self.with_vm(&handle.name, DriverOp::ByteCounters, |vm| {
            vm.counters.get(target).copied().ok_or_else(|| {
                VmctlError::driver(&handle.name, format!("invalid interface '{}'", target))
            })
        })
    }

    async fn list_active_names(&self) -> Result<Vec<String>> {
        let _guard = self.enter().await;
        Ok(self.state().vms.iter().filter(|(_, vm)| vm.active).map(|(n, _)| n.clone()).collect())
    }

    async fn list_defined_names(&self) -> Result<Vec<String>> {
        let _guard = self.enter().await;
        Ok(self.state().vms.iter().filter(|(_, vm)| !vm.active).map(|(n, _)| n.clone()).collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_define_start_stop_undefine() {
        let driver = InMemoryDriver::new();
        let handle = driver
            .define_from_descriptor("<domain type='kvm'><name>db_1</name></domain>")
            .await
            .unwrap();
        assert_eq!(handle.name, "db_1");
        assert_eq!(driver.list_defined_names().await.unwrap(), vec!["db_1"]);

        driver.start(&handle).await.unwrap();
        assert!(driver.is_active(&handle).await.unwrap());
        assert_eq!(driver.list_active_names().await.unwrap(), vec!["db_1"]);
        assert!(driver.list_defined_names().await.unwrap().is_empty());

        // Running domains cannot be undefined
        assert!(driver.undefine(&handle).await.is_err());

        driver.stop(&handle).await.unwrap();
        driver.undefine(&handle).await.unwrap();
        assert!(matches!(
            driver.lookup_by_name("db_1").await,
            Err(VmctlError::VmNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_restart_resets_counters() {
        let driver = InMemoryDriver::new();
        driver.add_vm("web_1", true);
        driver.set_cpu_time("web_1", 5_000_000_000);
        driver.set_byte_counters("web_1", "vnet0", 100, 200);

        let handle = VmHandle::new("web_1");
        driver.stop(&handle).await.unwrap();
        driver.start(&handle).await.unwrap();

        assert_eq!(driver.cpu_stats(&handle).await.unwrap(), 0);
        assert_eq!(
            driver.interface_byte_counters(&handle, "vnet0").await.unwrap(),
            ByteCounters::default()
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let driver = InMemoryDriver::new();
        driver.add_vm("web_1", false);
        driver.inject_failure("web_1", DriverOp::Start, "no bootable device");

        let err = driver.start(&VmHandle::new("web_1")).await.unwrap_err();
        assert!(err.to_string().contains("no bootable device"));

        driver.clear_failure("web_1", DriverOp::Start);
        driver.start(&VmHandle::new("web_1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_descriptor_without_name_rejected() {
        let driver = InMemoryDriver::new();
        let err = driver.define_from_descriptor("<domain/>").await.unwrap_err();
        assert!(matches!(err, VmctlError::InvalidDescriptor { .. }));
    }
}
