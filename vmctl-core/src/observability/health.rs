//! Health reporting for `GET /health`.

use crate::driver::HypervisorDriver;
use crate::error::VmctlError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub const SUBSYSTEM_DAEMON: &str = "daemon";
pub const SUBSYSTEM_DRIVER: &str = "driver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub version: String,
    pub subsystems: Vec<SubsystemHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

/// Tracks the health of named subsystems.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<Vec<SubsystemHealth>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a subsystem as healthy. Registering twice is a no-op.
    pub async fn register_subsystem(&self, name: &str) {
        let mut subsystems = self.subsystems.write().await;
        if subsystems.iter().all(|s| s.name != name) {
            subsystems.push(SubsystemHealth {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                message: None,
            });
        }
    }

    pub async fn update_subsystem(&self, name: &str, status: HealthStatus, message: Option<String>) {
        let mut subsystems = self.subsystems.write().await;
        if let Some(subsystem) = subsystems.iter_mut().find(|s| s.name == name) {
            subsystem.status = status;
            subsystem.message = message;
        }
    }

    /// Probe the hypervisor by listing VMs and record the result under
    /// [`SUBSYSTEM_DRIVER`]. Also refreshes the `vmctl_vm_count` gauges.
    pub async fn probe_driver(&self, driver: &dyn HypervisorDriver) -> HealthStatus {
        let listing = async {
            let active = driver.list_active_names().await?;
            let inactive = driver.list_defined_names().await?;
            Ok::<_, VmctlError>((active.len(), inactive.len()))
        };

        let (status, message) = match listing.await {
            Ok((running, stopped)) => {
                super::metrics::set_vm_count("running", running);
                super::metrics::set_vm_count("stopped", stopped);
                (HealthStatus::Healthy, None)
            }
            Err(e) => {
                warn!(driver = driver.name(), error = %e, "Driver health probe failed");
                (HealthStatus::Unhealthy, Some(e.to_string()))
            }
        };
        self.update_subsystem(SUBSYSTEM_DRIVER, status, message).await;
        status
    }

    /// Overall status: the worst status of any subsystem.
    pub async fn get_health(&self) -> HealthCheck {
        let subsystems = self.subsystems.read().await.clone();

        let status = if subsystems.iter().any(|s| s.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if subsystems.iter().any(|s| s.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthCheck { status, version: env!("CARGO_PKG_VERSION").to_string(), subsystems }
    }

    pub async fn is_ready(&self) -> bool {
        self.get_health().await.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InMemoryDriver;

    #[tokio::test]
    async fn test_worst_subsystem_wins() {
        let checker = HealthChecker::new();
        checker.register_subsystem(SUBSYSTEM_DAEMON).await;
        checker.register_subsystem(SUBSYSTEM_DRIVER).await;
        checker.register_subsystem(SUBSYSTEM_DRIVER).await;

        let health = checker.get_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.subsystems.len(), 2);
        assert!(checker.is_ready().await);

        checker
            .update_subsystem(SUBSYSTEM_DAEMON, HealthStatus::Degraded, Some("slow".to_string()))
            .await;
        assert_eq!(checker.get_health().await.status, HealthStatus::Degraded);

        checker
            .update_subsystem(SUBSYSTEM_DRIVER, HealthStatus::Unhealthy, Some("down".to_string()))
            .await;
        assert_eq!(checker.get_health().await.status, HealthStatus::Unhealthy);
        assert!(!checker.is_ready().await);
    }

    #[tokio::test]
    async fn test_probe_driver() {
        let checker = HealthChecker::new();
        checker.register_subsystem(SUBSYSTEM_DRIVER).await;
        let driver = InMemoryDriver::new();
        driver.add_vm("web_1", true);
        driver.add_vm("web_2", false);

        assert_eq!(checker.probe_driver(&driver).await, HealthStatus::Healthy);
        let health = checker.get_health().await;
        assert_eq!(health.subsystems[0].message, None);
    }
}
