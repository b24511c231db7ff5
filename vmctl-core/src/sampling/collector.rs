//! One-shot stats snapshots for a single VM.

use super::interfaces::{InterfaceDescriptor, InterfaceResolver};
use super::rate::{RateEngine, SampleQuality};
use super::store::{CounterKind, SampleKey};
use super::{round2, Clock, BYTES_PER_MB, NANOS_PER_SEC};
use crate::driver::{ByteCounters, HypervisorDriver, IpAddress};
use crate::error::{Result, VmctlError};
use crate::observability::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Warning reported when neither address source knows any interface.
pub const NO_INTERFACES_WARNING: &str = "no network interfaces found";

/// Stats of one running VM at one point in time.
///
/// Rates are per second; sizes and throughput use binary megabytes. Every
/// figure is rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub vm_name: String,

    /// CPU time consumed per wall second, in percent of one core
    pub cpu_load: f64,

    /// Cumulative CPU time of the running instance
    pub cpu_time_seconds: f64,

    /// Resident memory
    pub memory_used: f64,

    /// Memory ceiling
    pub memory_max: f64,

    pub interfaces: Vec<InterfaceThroughput>,

    /// Least trustworthy quality among all rates in this snapshot
    pub sample_quality: SampleQuality,

    /// Soft failures that did not prevent the snapshot
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceThroughput {
    pub interface: String,

    /// Identifier the byte counters were read from
    pub counter_target: String,

    pub addresses: Vec<IpAddress>,
    pub rx_mb_per_sec: f64,
    pub tx_mb_per_sec: f64,
    pub rx_total_mb: f64,
    pub tx_total_mb: f64,
    pub quality: SampleQuality,
}

/// Collects stats snapshots.
///
/// All driver calls of a snapshot happen before the sample store is touched,
/// and the store writes run without awaiting in between. A request dropped
/// mid-way therefore leaves the store as it was.
pub struct StatsCollector {
    driver: Arc<dyn HypervisorDriver>,
    resolver: InterfaceResolver,
    engine: RateEngine,
    clock: Arc<dyn Clock>,
}

struct InterfaceReading {
    iface: InterfaceDescriptor,
    target: String,
    counters: ByteCounters,
}

impl StatsCollector {
    pub fn new(
        driver: Arc<dyn HypervisorDriver>,
        resolver: InterfaceResolver,
        engine: RateEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { driver, resolver, engine, clock }
    }

    pub fn engine(&self) -> &RateEngine {
        &self.engine
    }

    /// Take a snapshot of `vm_name`.
    ///
    /// Fails with `VmNotFound` for unknown VMs and `VmNotRunning` for
    /// defined but stopped ones.
    #[instrument(skip(self))]
    pub async fn collect(&self, vm_name: &str) -> Result<StatsSnapshot> {
        let result = self.collect_inner(vm_name).await;
        metrics::record_stats_collection(match &result {
            Ok(_) => "success",
            Err(e) => e.kind().as_str(),
        });
        result
    }

    async fn collect_inner(&self, vm_name: &str) -> Result<StatsSnapshot> {
        let handle = self.driver.lookup_by_name(vm_name).await?;
        if !self.driver.is_active(&handle).await? {
            return Err(VmctlError::VmNotRunning { vm_name: vm_name.to_string() });
        }

        let cpu_time_ns = self.driver.cpu_stats(&handle).await?;
        let memory = self.driver.memory_stats(&handle).await?;

        let mut warnings = Vec::new();
        let interfaces = self.resolver.resolve_interfaces(&handle).await;
        if interfaces.is_empty() {
            warnings.push(NO_INTERFACES_WARNING.to_string());
        }

        let mut readings = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            let target = iface.counter_target(self.resolver.fallback_interface());
            match self.driver.interface_byte_counters(&handle, &target).await {
                Ok(counters) => readings.push(InterfaceReading { iface, target, counters }),
                Err(e) => {
                    warn!(vm_name, interface = %iface.name, %target, error = %e, "Byte counter query failed");
                    warnings.push(format!("interface {}: {}", iface.name, e));
                }
            }
        }

        // No awaits past this point
        let now = self.clock.now();

        let cpu = self.engine.observe(SampleKey::cpu(vm_name), cpu_time_ns, now);
        let mut quality = cpu.quality;

        // Interfaces sharing a counter target share one observation
        let mut observed: HashMap<String, (f64, f64, SampleQuality)> = HashMap::new();
        let mut throughput = Vec::with_capacity(readings.len());
        for reading in readings {
            let (rx_rate, tx_rate, iface_quality) = match observed.get(&reading.target) {
                Some(rates) => *rates,
                None => {
                    let rx = self.engine.observe(
                        SampleKey::net(vm_name, CounterKind::NetRxBytes, &reading.target),
                        reading.counters.rx_bytes,
                        now,
                    );
                    let tx = self.engine.observe(
                        SampleKey::net(vm_name, CounterKind::NetTxBytes, &reading.target),
                        reading.counters.tx_bytes,
                        now,
                    );
                    let rates = (rx.value_per_second, tx.value_per_second, rx.quality.combine(tx.quality));
                    observed.insert(reading.target.clone(), rates);
                    rates
                }
            };
            quality = quality.combine(iface_quality);

            throughput.push(InterfaceThroughput {
                interface: reading.iface.name,
                counter_target: reading.target,
                addresses: reading.iface.addresses,
                rx_mb_per_sec: round2(rx_rate),
                tx_mb_per_sec: round2(tx_rate),
                rx_total_mb: round2(reading.counters.rx_bytes as f64 / BYTES_PER_MB),
                tx_total_mb: round2(reading.counters.tx_bytes as f64 / BYTES_PER_MB),
                quality: iface_quality,
            });
        }

        debug!(vm_name, quality = quality.as_str(), interfaces = throughput.len(), "Stats collected");

        Ok(StatsSnapshot {
            vm_name: vm_name.to_string(),
            cpu_load: round2(cpu.value_per_second * 100.0),
            cpu_time_seconds: round2(cpu_time_ns as f64 / NANOS_PER_SEC),
            memory_used: round2(memory.rss_kib as f64 / 1024.0),
            memory_max: round2(memory.max_kib as f64 / 1024.0),
            interfaces: throughput,
            sample_quality: quality,
            warnings,
        })
    }
}
