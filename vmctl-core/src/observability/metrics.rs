//! Core metrics definitions.
//!
//! Names follow Prometheus conventions: `_total` for counters, `_seconds`
//! for duration histograms.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register descriptions so every series shows up in `/metrics` with help text.
pub fn register_core_metrics() {
    describe_counter!(
        "vmctl_vm_operations_total",
        "Per-VM lifecycle operations (by operation, outcome)"
    );
    describe_histogram!(
        "vmctl_bulk_operation_duration_seconds",
        "Wall time of a bulk operation across its whole group (by operation)"
    );
    describe_gauge!("vmctl_vm_count", "Defined VMs (by state: running, stopped)");

    describe_counter!("vmctl_stats_collections_total", "Stats snapshots taken (by outcome)");
    describe_counter!(
        "vmctl_rate_samples_total",
        "Rates derived from cumulative counters (by counter, quality)"
    );

    describe_histogram!("vmctl_disk_provision_duration_seconds", "Time spent running qemu-img");
}

pub fn record_vm_operation(operation: &str, outcome: &str) {
    counter!(
        "vmctl_vm_operations_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_bulk_duration(operation: &str, duration_secs: f64) {
    histogram!("vmctl_bulk_operation_duration_seconds", "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn record_stats_collection(outcome: &str) {
    counter!("vmctl_stats_collections_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_rate_sample(counter_kind: &str, quality: &str) {
    counter!(
        "vmctl_rate_samples_total",
        "counter" => counter_kind.to_string(),
        "quality" => quality.to_string()
    )
    .increment(1);
}

pub fn record_disk_provisioned(duration_secs: f64) {
    histogram!("vmctl_disk_provision_duration_seconds").record(duration_secs);
}

pub fn set_vm_count(state: &str, count: usize) {
    gauge!("vmctl_vm_count", "state" => state.to_string()).set(count as f64);
}
