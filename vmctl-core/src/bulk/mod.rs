//! Bulk lifecycle operations over groups of VMs.
//!
//! A group is an explicit list of names, every VM named `{base}_*`, or the
//! numbered names `{base}_1..={base}_N`. Each VM is handled independently
//! with bounded concurrency; one VM failing never stops or undoes the others.

mod report;

pub use report::{BulkFailure, BulkReport, BulkSuccess};

use crate::error::{Result, VmctlError};
use crate::lifecycle::{CreateSpec, VmLifecycle};
use crate::observability::metrics;
use futures_util::{stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Separator between a group's base name and the member index.
pub const GROUP_SEPARATOR: char = '_';

/// Lifecycle operation applied to every VM of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOperation {
    Create(CreateSpec),
    Start,
    Stop,
    Delete,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }
}

/// Which VMs a bulk operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Explicit(Vec<String>),
    /// Every defined VM named `{base}_...`
    PrefixGroup(String),
    /// `{base_name}_1` through `{base_name}_{count}`
    Numbered { base_name: String, count: u32 },
}

impl Targets {
    fn selector(&self) -> String {
        match self {
            Self::Explicit(_) => "the given VM list".to_string(),
            Self::PrefixGroup(base) => format!("prefix '{}{}'", base, GROUP_SEPARATOR),
            Self::Numbered { base_name, count } => {
                format!("'{}{}1..{}'", base_name, GROUP_SEPARATOR, count)
            }
        }
    }
}

/// Fans lifecycle operations out over VM groups.
pub struct BulkCoordinator {
    lifecycle: Arc<VmLifecycle>,
    parallelism: usize,
}

impl BulkCoordinator {
    pub fn new(lifecycle: Arc<VmLifecycle>, parallelism: usize) -> Self {
        Self { lifecycle, parallelism: parallelism.max(1) }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Resolve targets into an ordered list of distinct VM names.
    ///
    /// Fails with `NoMatchingVms` when nothing matches.
    pub async fn resolve(&self, targets: &Targets) -> Result<Vec<String>> {
        let names: Vec<String> = match targets {
            Targets::Explicit(names) => {
                let mut seen = HashSet::new();
                names.iter().filter(|n| seen.insert(n.as_str())).cloned().collect()
            }
            Targets::PrefixGroup(base) => {
                let prefix = format!("{}{}", base, GROUP_SEPARATOR);
                self.lifecycle
                    .all_names()
                    .await?
                    .into_iter()
                    .filter(|name| name.starts_with(&prefix))
                    .collect()
            }
            Targets::Numbered { base_name, count } => {
                (1..=*count).map(|i| format!("{}{}{}", base_name, GROUP_SEPARATOR, i)).collect()
            }
        };

        if names.is_empty() {
            return Err(VmctlError::NoMatchingVms { selector: targets.selector() });
        }
        Ok(names)
    }

    /// Run `operation` on every target VM, at most `parallelism` at a time.
    /// A request may lower the coordinator's bound but never raise it.
    ///
    /// Only target resolution can fail; per-VM failures end up in the report.
    #[instrument(skip(self, operation), fields(operation = operation.as_str()))]
    pub async fn execute(
        &self,
        operation: &BulkOperation,
        targets: &Targets,
        parallelism: Option<usize>,
    ) -> Result<BulkReport> {
        let names = self.resolve(targets).await?;
        let parallelism = parallelism.map_or(self.parallelism, |p| p.min(self.parallelism)).max(1);
        let started = Instant::now();
        info!(vms = names.len(), parallelism, "Starting bulk operation");

        let results: Vec<(String, Result<String>)> = stream::iter(names)
            .map(|vm_name| async move {
                let result = self.run_one(operation, &vm_name).await;
                (vm_name, result)
            })
            .buffer_unordered(parallelism)
            .collect()
            .await;

        let mut report = BulkReport::new(operation.as_str());
        for (vm_name, result) in results {
            match result {
                Ok(detail) => report.push_success(vm_name, detail),
                Err(e) => {
                    warn!(vm_name = %vm_name, error = %e, "Bulk operation failed for VM");
                    report.push_failure(vm_name, &e);
                }
            }
        }
        report.sort();

        metrics::record_bulk_duration(operation.as_str(), started.elapsed().as_secs_f64());
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk operation finished"
        );
        Ok(report)
    }

    async fn run_one(&self, operation: &BulkOperation, vm_name: &str) -> Result<String> {
        match operation {
            BulkOperation::Create(spec) => {
                self.lifecycle.create(vm_name, spec).await.map(|o| o.detail())
            }
            BulkOperation::Start => {
                self.lifecycle.start(vm_name).await.map(|o| o.detail().to_string())
            }
            BulkOperation::Stop => {
                self.lifecycle.stop(vm_name).await.map(|o| o.detail().to_string())
            }
            BulkOperation::Delete => {
                self.lifecycle.delete(vm_name).await.map(|o| o.detail().to_string())
            }
        }
    }
}
