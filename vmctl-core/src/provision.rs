//! Disk image provisioning.
//!
//! Per-VM qcow2 images are produced from a base image with `qemu-img`, either
//! as a full copy or as a thin overlay backed by the base image.

use crate::error::{Result, VmctlError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Disk provisioning capability.
#[async_trait]
pub trait DiskProvisioner: Send + Sync {
    /// Produce `target` from `base`. Never overwrites an existing image.
    async fn clone_or_create(&self, base: &Path, target: &Path, size_gb: u32) -> Result<()>;

    /// Remove an image. Removing an image that does not exist succeeds.
    async fn delete(&self, path: &Path) -> Result<()>;
}

/// How a VM disk is derived from its base image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionMode {
    /// Independent full copy of the base image
    #[default]
    FullClone,
    /// Copy-on-write overlay with the base image as backing file
    Overlay,
}

/// `qemu-img` command line for one provisioning request.
pub fn qemu_img_args(mode: ProvisionMode, base: &Path, target: &Path, size_gb: u32) -> Vec<String> {
    let base = base.to_string_lossy().to_string();
    let target = target.to_string_lossy().to_string();
    match mode {
        ProvisionMode::FullClone => {
            vec!["convert".into(), "-f".into(), "qcow2".into(), "-O".into(), "qcow2".into(), base, target]
        }
        ProvisionMode::Overlay => vec![
            "create".into(),
            "-f".into(),
            "qcow2".into(),
            "-o".into(),
            format!("backing_file={},backing_fmt=qcow2", base),
            target,
            format!("{}G", size_gb),
        ],
    }
}

/// `DiskProvisioner` that shells out to `qemu-img`.
#[derive(Debug, Clone)]
pub struct QemuImgProvisioner {
    binary: PathBuf,
    mode: ProvisionMode,
}

impl QemuImgProvisioner {
    pub fn new(mode: ProvisionMode) -> Self {
        Self { binary: PathBuf::from("qemu-img"), mode }
    }

    /// Use a specific `qemu-img` binary.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn mode(&self) -> ProvisionMode {
        self.mode
    }
}

#[async_trait]
impl DiskProvisioner for QemuImgProvisioner {
    #[instrument(skip(self), fields(mode = ?self.mode))]
    async fn clone_or_create(&self, base: &Path, target: &Path, size_gb: u32) -> Result<()> {
        let fail = |reason: String| VmctlError::Provision { path: target.to_path_buf(), reason };

        if !base.exists() {
            return Err(fail(format!("base image {} does not exist", base.display())));
        }
        if target.exists() {
            return Err(fail("image already exists".to_string()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VmctlError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        let args = qemu_img_args(self.mode, base, target, size_gb);
        debug!(binary = %self.binary.display(), ?args, "Running qemu-img");

        let started = Instant::now();
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| fail(format!("failed to run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("qemu-img exited with {}: {}", output.status, stderr.trim())));
        }

        crate::observability::metrics::record_disk_provisioned(started.elapsed().as_secs_f64());
        info!(target = %target.display(), "Disk image provisioned");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Disk image removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Disk image already absent");
                Ok(())
            }
            Err(e) => Err(VmctlError::Provision { path: path.to_path_buf(), reason: e.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_clone_args() {
        let args = qemu_img_args(
            ProvisionMode::FullClone,
            Path::new("/vms/base.qcow2"),
            Path::new("/vms/web_1.qcow2"),
            20,
        );
        assert_eq!(
            args,
            ["convert", "-f", "qcow2", "-O", "qcow2", "/vms/base.qcow2", "/vms/web_1.qcow2"]
        );
    }

    #[test]
    fn test_overlay_args() {
        let args = qemu_img_args(
            ProvisionMode::Overlay,
            Path::new("/vms/base.qcow2"),
            Path::new("/vms/web_1.qcow2"),
            20,
        );
        assert_eq!(args[0], "create");
        assert!(args.contains(&"backing_file=/vms/base.qcow2,backing_fmt=qcow2".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("20G"));
    }

    #[tokio::test]
    async fn test_missing_base_image() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = QemuImgProvisioner::new(ProvisionMode::FullClone);
        let err = provisioner
            .clone_or_create(&dir.path().join("base.qcow2"), &dir.path().join("vm.qcow2"), 20)
            .await
            .unwrap_err();
        assert!(matches!(err, VmctlError::Provision { .. }));
    }

    #[tokio::test]
    async fn test_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.qcow2");
        let target = dir.path().join("vm.qcow2");
        std::fs::write(&base, b"base").unwrap();
        std::fs::write(&target, b"existing").unwrap();

        let provisioner = QemuImgProvisioner::new(ProvisionMode::FullClone).with_binary("true");
        let err = provisioner.clone_or_create(&base, &target, 20).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read(&target).unwrap(), b"existing");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.qcow2");
        std::fs::write(&base, b"base").unwrap();

        let provisioner = QemuImgProvisioner::new(ProvisionMode::Overlay).with_binary("false");
        let err = provisioner
            .clone_or_create(&base, &dir.path().join("images").join("vm.qcow2"), 20)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("qemu-img exited"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.qcow2");
        std::fs::write(&path, b"disk").unwrap();

        let provisioner = QemuImgProvisioner::new(ProvisionMode::FullClone);
        provisioner.delete(&path).await.unwrap();
        assert!(!path.exists());
        provisioner.delete(&path).await.unwrap();
    }
}
