//! Rate derivation from cumulative counters.

use super::store::{CounterSample, SampleKey, SampleStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// How much a derived rate can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleQuality {
    /// First observation of the counter, no history yet
    Baseline,
    /// Real rate over a positive interval
    Measured,
    /// Interval was zero or negative (clock skew, same tick)
    Unreliable,
    /// Counter went backwards, typically after a VM restart
    CounterReset,
}

impl SampleQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Measured => "measured",
            Self::Unreliable => "unreliable",
            Self::CounterReset => "counter_reset",
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Measured)
    }

    /// Quality of a value derived from two samples: the less trustworthy one wins.
    pub fn combine(self, other: Self) -> Self {
        fn rank(q: SampleQuality) -> u8 {
            match q {
                SampleQuality::Measured => 0,
                SampleQuality::Baseline => 1,
                SampleQuality::CounterReset => 2,
                SampleQuality::Unreliable => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

/// Derived per-second rate in reporting units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub value_per_second: f64,
    pub as_of: SystemTime,
    pub quality: SampleQuality,
}

impl RateSample {
    fn zero(as_of: SystemTime, quality: SampleQuality) -> Self {
        Self { value_per_second: 0.0, as_of, quality }
    }
}

/// Rate of a cumulative counter between `previous` and the current reading.
///
/// Never fails: missing history, a non-positive interval and a counter that
/// went backwards all yield `0.0` with the matching [`SampleQuality`].
pub fn derive_rate(
    previous: Option<CounterSample>,
    current_value: u64,
    current_timestamp: SystemTime,
    unit_divisor: f64,
) -> RateSample {
    let Some(previous) = previous else {
        return RateSample::zero(current_timestamp, SampleQuality::Baseline);
    };

    let interval = match current_timestamp.duration_since(previous.timestamp) {
        Ok(elapsed) if !elapsed.is_zero() => elapsed.as_secs_f64(),
        _ => return RateSample::zero(current_timestamp, SampleQuality::Unreliable),
    };

    if current_value < previous.value {
        return RateSample::zero(current_timestamp, SampleQuality::CounterReset);
    }

    let delta = (current_value - previous.value) as f64;
    RateSample {
        value_per_second: delta / unit_divisor / interval,
        as_of: current_timestamp,
        quality: SampleQuality::Measured,
    }
}

/// Applies [`derive_rate`] against a [`SampleStore`].
///
/// Every observation replaces the stored sample, whatever its quality.
#[derive(Clone)]
pub struct RateEngine {
    store: Arc<dyn SampleStore>,
}

impl RateEngine {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.store
    }

    /// Record a reading and return the rate since the previous one.
    pub fn observe(&self, key: SampleKey, value: u64, timestamp: SystemTime) -> RateSample {
        let kind = key.kind;
        let previous = self.store.exchange(key, CounterSample { timestamp, value });
        let rate = derive_rate(previous, value, timestamp, kind.unit_divisor());

        if !rate.quality.is_authoritative() {
            debug!(counter = kind.as_str(), quality = rate.quality.as_str(), "Non-authoritative rate sample");
        }
        crate::observability::metrics::record_rate_sample(kind.as_str(), rate.quality.as_str());
        rate
    }
}

impl std::fmt::Debug for RateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::store::{CounterKind, InMemorySampleStore};
    use crate::sampling::{BYTES_PER_MB, NANOS_PER_SEC};
    use std::time::Duration;

    fn at(millis: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }

    fn sample(millis: u64, value: u64) -> Option<CounterSample> {
        Some(CounterSample { timestamp: at(millis), value })
    }

    #[test]
    fn test_first_sample_is_baseline() {
        let rate = derive_rate(None, 5_000, at(1_000), NANOS_PER_SEC);
        assert_eq!(rate.value_per_second, 0.0);
        assert_eq!(rate.quality, SampleQuality::Baseline);
        assert_eq!(rate.as_of, at(1_000));
    }

    #[test]
    fn test_measured_rate() {
        // 3 CPU seconds over 2 wall seconds
        let rate = derive_rate(sample(1_000, 1_000_000_000), 4_000_000_000, at(3_000), NANOS_PER_SEC);
        assert_eq!(rate.quality, SampleQuality::Measured);
        assert!((rate.value_per_second - 1.5).abs() < 1e-9);

        // 10 MiB over 4 seconds
        let rate = derive_rate(sample(0, 0), 10 * 1_048_576, at(4_000), BYTES_PER_MB);
        assert!((rate.value_per_second - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_rate_matches_formula_over_many_pairs() {
        let pairs = [(0u64, 0u64, 1u64, 1u64), (10, 500, 20, 9_000), (7, 7, 8, 7), (100, 1, 2_500, 123_456_789)];
        for (t0, v0, t1, v1) in pairs {
            let rate = derive_rate(sample(t0, v0), v1, at(t1), 1.0);
            let expected = (v1 - v0) as f64 / ((t1 - t0) as f64 / 1000.0);
            assert_eq!(rate.quality, SampleQuality::Measured);
            assert!((rate.value_per_second - expected).abs() < 1e-6 * expected.max(1.0));
        }
    }

    #[test]
    fn test_counter_regression_is_reset_not_negative() {
        let rate = derive_rate(sample(1_000, 9_000), 100, at(2_000), 1.0);
        assert_eq!(rate.value_per_second, 0.0);
        assert_eq!(rate.quality, SampleQuality::CounterReset);
    }

    #[test]
    fn test_non_positive_interval_is_unreliable() {
        let same_tick = derive_rate(sample(1_000, 10), 20, at(1_000), 1.0);
        assert_eq!(same_tick.value_per_second, 0.0);
        assert_eq!(same_tick.quality, SampleQuality::Unreliable);

        let backwards = derive_rate(sample(2_000, 10), 20, at(1_000), 1.0);
        assert_eq!(backwards.value_per_second, 0.0);
        assert_eq!(backwards.quality, SampleQuality::Unreliable);
    }

    #[test]
    fn test_engine_always_replaces_baseline() {
        let store = Arc::new(InMemorySampleStore::new());
        let engine = RateEngine::new(store.clone());
        let key = SampleKey::cpu("web_1");

        let first = engine.observe(key.clone(), 1_000_000_000, at(0));
        assert_eq!(first.quality, SampleQuality::Baseline);
        assert_eq!(store.get_previous(&key), sample(0, 1_000_000_000));

        let second = engine.observe(key.clone(), 2_000_000_000, at(1_000));
        assert_eq!(second.quality, SampleQuality::Measured);
        assert!((second.value_per_second - 1.0).abs() < 1e-9);

        // Restart: counter drops, new baseline is stored anyway
        let reset = engine.observe(key.clone(), 5, at(2_000));
        assert_eq!(reset.quality, SampleQuality::CounterReset);
        assert_eq!(store.get_previous(&key), sample(2_000, 5));

        // Same tick: unreliable, sample still stored
        let skew = engine.observe(key.clone(), 9, at(2_000));
        assert_eq!(skew.quality, SampleQuality::Unreliable);
        assert_eq!(store.get_previous(&key), sample(2_000, 9));

        let next = engine.observe(key.clone(), 1_000_000_009, at(4_000));
        assert_eq!(next.quality, SampleQuality::Measured);
        assert!((next.value_per_second - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_engine_keeps_vms_apart() {
        let engine = RateEngine::new(Arc::new(InMemorySampleStore::new()));
        engine.observe(SampleKey::net("a", CounterKind::NetRxBytes, "vnet0"), 0, at(0));
        let b = engine.observe(SampleKey::net("b", CounterKind::NetRxBytes, "vnet0"), 1_048_576, at(1_000));
        assert_eq!(b.quality, SampleQuality::Baseline);

        let a = engine.observe(SampleKey::net("a", CounterKind::NetRxBytes, "vnet0"), 1_048_576, at(1_000));
        assert_eq!(a.quality, SampleQuality::Measured);
        assert!((a.value_per_second - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_quality_combine() {
        use SampleQuality::*;
        assert_eq!(Measured.combine(Measured), Measured);
        assert_eq!(Measured.combine(Baseline), Baseline);
        assert_eq!(CounterReset.combine(Baseline), CounterReset);
        assert_eq!(Baseline.combine(Unreliable), Unreliable);
    }
}
