use crate::error::{ErrorKind, VmctlError};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkSuccess {
    pub vm_name: String,
    /// Outcome, e.g. "started" or "already running"
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub vm_name: String,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Per-VM outcomes of one bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub operation: String,
    pub succeeded: Vec<BulkSuccess>,
    pub failed: Vec<BulkFailure>,
}

impl BulkReport {
    pub fn new(operation: &str) -> Self {
        Self { operation: operation.to_string(), succeeded: Vec::new(), failed: Vec::new() }
    }

    pub fn push_success(&mut self, vm_name: String, detail: impl Into<String>) {
        self.succeeded.push(BulkSuccess { vm_name, detail: detail.into() });
    }

    pub fn push_failure(&mut self, vm_name: String, error: &VmctlError) {
        self.failed.push(BulkFailure { vm_name, kind: error.kind(), reason: error.to_string() });
    }

    /// Sort both lists by VM name.
    pub fn sort(&mut self) {
        self.succeeded.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        self.failed.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when every name in `names` appears exactly once across both
    /// lists and nothing else does.
    pub fn is_complete_for(&self, names: &[String]) -> bool {
        let reported: Vec<&str> = self
            .succeeded
            .iter()
            .map(|s| s.vm_name.as_str())
            .chain(self.failed.iter().map(|f| f.vm_name.as_str()))
            .collect();

        let expected: HashSet<&str> = names.iter().map(String::as_str).collect();
        let unique: HashSet<&str> = reported.iter().copied().collect();
        unique.len() == reported.len() && unique == expected
    }
}
