//! Error types for vmctl.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Soft outcomes such as "already running" are not errors and live in
//! [`crate::lifecycle`].

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vmctl operations.
pub type Result<T> = std::result::Result<T, VmctlError>;

/// Main error type for vmctl.
#[derive(Error, Debug)]
pub enum VmctlError {
    // VM lifecycle errors
    #[error("VM not found: {vm_name}")]
    VmNotFound { vm_name: String },

    #[error("VM {vm_name} is not running")]
    VmNotRunning { vm_name: String },

    #[error("VM {vm_name} already exists")]
    VmAlreadyExists { vm_name: String },

    #[error("No VMs match {selector}")]
    NoMatchingVms { selector: String },

    // Hypervisor errors
    #[error("Hypervisor error{}: {reason}", vm_suffix(.vm_name))]
    Driver { vm_name: Option<String>, reason: String },

    #[error("Failed to connect to hypervisor at {uri}: {reason}")]
    ConnectionFailed { uri: String, reason: String },

    #[error("Invalid VM descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    // Storage errors
    #[error("Disk provisioning failed for {path:?}: {reason}")]
    Provision { path: PathBuf, reason: String },

    // Guest errors
    #[error("Guest configuration of {vm_name} failed after {attempts} attempt(s): {reason}")]
    GuestConfig { vm_name: String, attempts: u32, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn vm_suffix(vm_name: &Option<String>) -> String {
    match vm_name {
        Some(name) => format!(" for VM {}", name),
        None => String::new(),
    }
}

/// Stable, machine-readable classification of a [`VmctlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    VmNotFound,
    VmNotRunning,
    VmAlreadyExists,
    NoMatchingVms,
    DriverError,
    ProvisionError,
    InvalidDescriptor,
    GuestConfigError,
    InvalidConfig,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VmNotFound => "vm_not_found",
            Self::VmNotRunning => "vm_not_running",
            Self::VmAlreadyExists => "vm_already_exists",
            Self::NoMatchingVms => "no_matching_vms",
            Self::DriverError => "driver_error",
            Self::ProvisionError => "provision_error",
            Self::InvalidDescriptor => "invalid_descriptor",
            Self::GuestConfigError => "guest_config_error",
            Self::InvalidConfig => "invalid_config",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VmctlError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap a hypervisor failure for a specific VM.
    pub fn driver(vm_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Driver { vm_name: Some(vm_name.into()), reason: reason.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VmNotFound { .. } => ErrorKind::VmNotFound,
            Self::VmNotRunning { .. } => ErrorKind::VmNotRunning,
            Self::VmAlreadyExists { .. } => ErrorKind::VmAlreadyExists,
            Self::NoMatchingVms { .. } => ErrorKind::NoMatchingVms,
            Self::Driver { .. } | Self::ConnectionFailed { .. } => ErrorKind::DriverError,
            Self::Provision { .. } | Self::IoError { .. } => ErrorKind::ProvisionError,
            Self::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            Self::GuestConfig { .. } => ErrorKind::GuestConfigError,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::Internal(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// The VM this error is about, when there is one.
    pub fn vm_name(&self) -> Option<&str> {
        match self {
            Self::VmNotFound { vm_name }
            | Self::VmNotRunning { vm_name }
            | Self::VmAlreadyExists { vm_name }
            | Self::GuestConfig { vm_name, .. } => Some(vm_name),
            Self::Driver { vm_name, .. } => vm_name.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_message_names_vm() {
        let err = VmctlError::driver("web_1", "domain crashed");
        assert_eq!(err.to_string(), "Hypervisor error for VM web_1: domain crashed");
        assert_eq!(err.vm_name(), Some("web_1"));
        assert_eq!(err.kind(), ErrorKind::DriverError);

        let err = VmctlError::Driver { vm_name: None, reason: "connection lost".into() };
        assert_eq!(err.to_string(), "Hypervisor error: connection lost");
        assert_eq!(err.vm_name(), None);
    }

    #[test]
    fn test_error_kinds_are_snake_case() {
        let err = VmctlError::NoMatchingVms { selector: "prefix 'web'".into() };
        assert_eq!(err.kind().as_str(), "no_matching_vms");
        assert_eq!(serde_json::to_string(&err.kind()).unwrap(), "\"no_matching_vms\"");
    }
}
