//! Last-seen cumulative counter values, one entry per VM counter.

use super::{BYTES_PER_MB, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Kind of cumulative counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    CpuTimeNs,
    NetRxBytes,
    NetTxBytes,
}

impl CounterKind {
    /// Divisor converting raw counter units into reporting units
    /// (nanoseconds → seconds, bytes → megabytes).
    pub fn unit_divisor(&self) -> f64 {
        match self {
            Self::CpuTimeNs => NANOS_PER_SEC,
            Self::NetRxBytes | Self::NetTxBytes => BYTES_PER_MB,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuTimeNs => "cpu_time_ns",
            Self::NetRxBytes => "net_rx_bytes",
            Self::NetTxBytes => "net_tx_bytes",
        }
    }
}

/// Store key. `device` separates the counters of different interfaces of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub vm_name: String,
    pub kind: CounterKind,
    pub device: Option<String>,
}

impl SampleKey {
    pub fn cpu(vm_name: &str) -> Self {
        Self { vm_name: vm_name.to_string(), kind: CounterKind::CpuTimeNs, device: None }
    }

    pub fn net(vm_name: &str, kind: CounterKind, device: &str) -> Self {
        Self { vm_name: vm_name.to_string(), kind, device: Some(device.to_string()) }
    }
}

/// One observation of a cumulative counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub timestamp: SystemTime,
    pub value: u64,
}

/// Storage for the previous sample of every counter.
///
/// Implementations must make `exchange` atomic per key, so two concurrent
/// readings of the same counter never difference against the same baseline.
pub trait SampleStore: Send + Sync {
    fn get_previous(&self, key: &SampleKey) -> Option<CounterSample>;

    /// Overwrite the stored sample unconditionally.
    fn put(&self, key: SampleKey, sample: CounterSample);

    /// Store `sample` and return the sample it replaced.
    fn exchange(&self, key: SampleKey, sample: CounterSample) -> Option<CounterSample>;

    /// Drop every sample of a VM.
    fn forget_vm(&self, vm_name: &str);
}

/// `SampleStore` backed by a single mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemorySampleStore {
    samples: Mutex<HashMap<SampleKey, CounterSample>>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn samples(&self) -> MutexGuard<'_, HashMap<SampleKey, CounterSample>> {
        self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.samples().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples().is_empty()
    }
}

impl SampleStore for InMemorySampleStore {
    fn get_previous(&self, key: &SampleKey) -> Option<CounterSample> {
        self.samples().get(key).copied()
    }

    fn put(&self, key: SampleKey, sample: CounterSample) {
        self.samples().insert(key, sample);
    }

    fn exchange(&self, key: SampleKey, sample: CounterSample) -> Option<CounterSample> {
        self.samples().insert(key, sample)
    }

    fn forget_vm(&self, vm_name: &str) {
        self.samples().retain(|key, _| key.vm_name != vm_name);
    }
}
