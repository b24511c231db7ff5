//! Single-VM lifecycle: list, create, start, stop, delete.
//!
//! Start and stop are idempotent and report a soft outcome when there is
//! nothing to do. Create and delete are multi-step and not transactional:
//! a failure leaves earlier steps in place and the error says which step
//! broke.

use crate::config::Config;
use crate::descriptor::{mac_for, DescriptorParams, DescriptorTemplate};
use crate::driver::{HypervisorDriver, VmHandle};
use crate::error::{Result, VmctlError};
use crate::guest::{GuestConfigurator, RetryPolicy};
use crate::observability::metrics;
use crate::provision::DiskProvisioner;
use crate::sampling::SampleStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Power state as shown in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub status: VmStatus,
}

/// What to build when creating a VM. Unset sizes fall back to the config defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSpec {
    pub base_disk: PathBuf,
    #[serde(default)]
    pub iso_image: Option<PathBuf>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub vcpus: Option<u32>,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    /// Boot the VM once defined, then run the guest configurator if one is set
    #[serde(default)]
    pub start_after_create: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateOutcome {
    pub vm_name: String,
    pub disk_path: PathBuf,
    pub started: bool,
    /// Attempts the guest configurator needed, if it ran
    pub guest_config_attempts: Option<u32>,
}

impl CreateOutcome {
    pub fn detail(&self) -> String {
        match (self.started, self.guest_config_attempts) {
            (false, _) => "created".to_string(),
            (true, None) => "created and started".to_string(),
            (true, Some(_)) => "created, started and configured".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

impl StartOutcome {
    pub fn detail(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyRunning => "already running",
        }
    }

    /// True when nothing had to be done.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

impl StopOutcome {
    pub fn detail(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::AlreadyStopped => "already stopped",
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::AlreadyStopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub was_running: bool,
}

impl DeleteOutcome {
    pub fn detail(&self) -> &'static str {
        if self.was_running {
            "stopped and deleted"
        } else {
            "deleted"
        }
    }
}

/// Lifecycle operations against one hypervisor.
pub struct VmLifecycle {
    driver: Arc<dyn HypervisorDriver>,
    provisioner: Arc<dyn DiskProvisioner>,
    guest: Option<(Arc<dyn GuestConfigurator>, RetryPolicy)>,
    samples: Option<Arc<dyn SampleStore>>,
    template: DescriptorTemplate,
    config: Config,
}

impl VmLifecycle {
    pub fn new(
        driver: Arc<dyn HypervisorDriver>,
        provisioner: Arc<dyn DiskProvisioner>,
        config: Config,
    ) -> Self {
        let template = DescriptorTemplate::from_config(config.descriptor_template.as_deref());
        Self { driver, provisioner, guest: None, samples: None, template, config }
    }

    /// Configure guests created with `start_after_create`.
    pub fn with_guest_configurator(
        mut self,
        configurator: Arc<dyn GuestConfigurator>,
        policy: RetryPolicy,
    ) -> Self {
        self.guest = Some((configurator, policy));
        self
    }

    /// Drop a VM's rate baselines when it is deleted.
    pub fn with_sample_store(mut self, store: Arc<dyn SampleStore>) -> Self {
        self.samples = Some(store);
        self
    }

    pub fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Running VMs first, then stopped ones, each sorted by name.
    pub async fn list(&self) -> Result<Vec<VmSummary>> {
        let mut active = self.driver.list_active_names().await?;
        let mut inactive = self.driver.list_defined_names().await?;
        active.sort();
        inactive.sort();

        Ok(active
            .into_iter()
            .map(|name| VmSummary { name, status: VmStatus::On })
            .chain(inactive.into_iter().map(|name| VmSummary { name, status: VmStatus::Off }))
            .collect())
    }

    /// Every defined VM name, running or not, sorted and deduplicated.
    pub async fn all_names(&self) -> Result<Vec<String>> {
        let mut names = self.driver.list_active_names().await?;
        names.extend(self.driver.list_defined_names().await?);
        names.sort();
        names.dedup();
        Ok(names)
    }

    #[instrument(skip(self, spec), fields(base_disk = %spec.base_disk.display()))]
    pub async fn create(&self, vm_name: &str, spec: &CreateSpec) -> Result<CreateOutcome> {
        let result = self.create_inner(vm_name, spec).await;
        record("create", result.as_ref().map(|_| "success"));
        result
    }

    async fn create_inner(&self, vm_name: &str, spec: &CreateSpec) -> Result<CreateOutcome> {
        match self.driver.lookup_by_name(vm_name).await {
            Ok(_) => return Err(VmctlError::VmAlreadyExists { vm_name: vm_name.to_string() }),
            Err(VmctlError::VmNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let disk_path = self.config.image_path(vm_name);
        let size_gb = spec.disk_size_gb.unwrap_or(self.config.default_disk_size_gb);
        self.provisioner.clone_or_create(&spec.base_disk, &disk_path, size_gb).await?;

        let params = DescriptorParams {
            vm_name: vm_name.to_string(),
            memory_mib: spec.memory_mb.unwrap_or(self.config.default_memory_mb),
            vcpus: spec.vcpus.unwrap_or(self.config.default_vcpus),
            disk_path: disk_path.clone(),
            iso_image: spec.iso_image.clone(),
            network: self.config.default_network.clone(),
            mac_address: mac_for(vm_name),
        };

        let handle = self
            .define(&params)
            .await
            .map_err(|e| disk_left_behind(e, &disk_path))?;
        info!(vm_name, disk = %disk_path.display(), "VM defined");

        let mut outcome = CreateOutcome {
            vm_name: vm_name.to_string(),
            disk_path: disk_path.clone(),
            started: false,
            guest_config_attempts: None,
        };
        if !spec.start_after_create {
            return Ok(outcome);
        }

        self.driver.start(&handle).await.map_err(|e| disk_left_behind(e, &disk_path))?;
        outcome.started = true;
        info!(vm_name, "VM started");

        if let Some((configurator, policy)) = &self.guest {
            let attempts = policy.configure(configurator.as_ref(), vm_name).await?;
            outcome.guest_config_attempts = Some(attempts);
        }
        Ok(outcome)
    }

    async fn define(&self, params: &DescriptorParams) -> Result<VmHandle> {
        let descriptor = self.template.render(params).await?;
        self.driver.define_from_descriptor(&descriptor).await
    }

    #[instrument(skip(self))]
    pub async fn start(&self, vm_name: &str) -> Result<StartOutcome> {
        let result = self.start_inner(vm_name).await;
        record("start", result.as_ref().map(|o| if o.is_noop() { "noop" } else { "success" }));
        result
    }

    async fn start_inner(&self, vm_name: &str) -> Result<StartOutcome> {
        let handle = self.driver.lookup_by_name(vm_name).await?;
        if self.driver.is_active(&handle).await? {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.driver.start(&handle).await?;
        info!(vm_name, "VM started");
        Ok(StartOutcome::Started)
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, vm_name: &str) -> Result<StopOutcome> {
        let result = self.stop_inner(vm_name).await;
        record("stop", result.as_ref().map(|o| if o.is_noop() { "noop" } else { "success" }));
        result
    }

    async fn stop_inner(&self, vm_name: &str) -> Result<StopOutcome> {
        let handle = self.driver.lookup_by_name(vm_name).await?;
        if !self.driver.is_active(&handle).await? {
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.driver.stop(&handle).await?;
        info!(vm_name, "VM stopped");
        Ok(StopOutcome::Stopped)
    }

    /// Stop if running, undefine, remove the disk image. A missing disk
    /// image is not an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, vm_name: &str) -> Result<DeleteOutcome> {
        let result = self.delete_inner(vm_name).await;
        record("delete", result.as_ref().map(|_| "success"));
        result
    }

    async fn delete_inner(&self, vm_name: &str) -> Result<DeleteOutcome> {
        let handle = self.driver.lookup_by_name(vm_name).await?;

        let was_running = self.driver.is_active(&handle).await?;
        if was_running {
            self.driver.stop(&handle).await.map_err(|e| at_step(e, "stop"))?;
            info!(vm_name, "VM stopped for deletion");
        }

        self.driver.undefine(&handle).await.map_err(|e| at_step(e, "undefine"))?;
        info!(vm_name, "VM undefined");

        let disk_path = self.config.image_path(vm_name);
        self.provisioner.delete(&disk_path).await.map_err(|e| at_step(e, "remove disk"))?;

        if let Some(store) = &self.samples {
            store.forget_vm(vm_name);
        }
        Ok(DeleteOutcome { was_running })
    }
}

fn record(operation: &str, outcome: std::result::Result<&str, &VmctlError>) {
    match outcome {
        Ok(label) => metrics::record_vm_operation(operation, label),
        Err(e) => metrics::record_vm_operation(operation, e.kind().as_str()),
    }
}

/// Prefix the failing step of a multi-step operation to the error reason.
fn at_step(err: VmctlError, step: &str) -> VmctlError {
    match err {
        VmctlError::Driver { vm_name, reason } => {
            VmctlError::Driver { vm_name, reason: format!("{} failed: {}", step, reason) }
        }
        VmctlError::Provision { path, reason } => {
            VmctlError::Provision { path, reason: format!("{} failed: {}", step, reason) }
        }
        other => other,
    }
}

fn disk_left_behind(err: VmctlError, disk: &std::path::Path) -> VmctlError {
    warn!(disk = %disk.display(), error = %err, "VM creation failed after disk provisioning");
    let note = format!("disk image {} was left in place", disk.display());
    match err {
        VmctlError::Driver { vm_name, reason } => {
            VmctlError::Driver { vm_name, reason: format!("{}; {}", reason, note) }
        }
        VmctlError::InvalidDescriptor { reason } => {
            VmctlError::InvalidDescriptor { reason: format!("{}; {}", reason, note) }
        }
        other => other,
    }
}
