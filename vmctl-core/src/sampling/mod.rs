//! Per-VM stats sampling and rate derivation.
//!
//! The hypervisor only exposes cumulative counters (CPU nanoseconds, bytes
//! transferred). Rates are derived by differencing each new reading against
//! the previous one kept in a [`SampleStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  cpu / memory / bytes  ┌──────────────────┐
//! │ HypervisorDriver │ ─────────────────────► │  StatsCollector  │
//! └──────────────────┘                        │  ├─ resolver     │
//!          ▲   interface addresses            │  ├─ RateEngine   │
//!          └───────────────────────────────── │  │  └─ store     │
//!                                             │  └─ snapshot     │
//!                                             └──────────────────┘
//! ```

mod collector;
mod interfaces;
mod rate;
mod store;

pub use collector::{InterfaceThroughput, StatsCollector, StatsSnapshot};
pub use interfaces::{InterfaceDescriptor, InterfaceResolver};
pub use rate::{derive_rate, RateEngine, RateSample, SampleQuality};
pub use store::{CounterKind, CounterSample, InMemorySampleStore, SampleKey, SampleStore};

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Nanoseconds per second, for CPU time counters.
pub const NANOS_PER_SEC: f64 = 1e9;

/// Bytes per megabyte. Binary megabytes are used for every byte counter.
pub const BYTES_PER_MB: f64 = 1_048_576.0;

/// Source of sample timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    /// Move the clock backwards, as a wall clock may after an NTP step.
    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now -= by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Round to two decimal places for presentation.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
