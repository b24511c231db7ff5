//! Request handlers.
//!
//! Bodies are JSON; every response carries `status`: `success`, `info` for
//! soft outcomes that changed nothing, or `error`.

use super::error::ApiError;
use super::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vmctl_core::{BulkOperation, CreateSpec, Targets};

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct CreateVmRequest {
    pub vm_name: String,
    pub base_disk: PathBuf,
    #[serde(default)]
    pub iso_image: Option<PathBuf>,
    /// Memory in MiB
    #[serde(default)]
    pub memory_allocation: Option<u32>,
    #[serde(default)]
    pub core_allocation: Option<u32>,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub start: bool,
}

impl CreateVmRequest {
    fn spec(&self) -> CreateSpec {
        CreateSpec {
            base_disk: self.base_disk.clone(),
            iso_image: self.iso_image.clone(),
            memory_mb: self.memory_allocation,
            vcpus: self.core_allocation,
            disk_size_gb: self.disk_size_gb,
            start_after_create: self.start,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VmNameRequest {
    pub vm_name: String,
}

/// Targets are `vm_names`, or `base_name` with an optional `count`.
/// Create needs `base_name` and `count` (or `vm_names`) plus `base_disk`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BulkRequest {
    pub vm_names: Option<Vec<String>>,
    pub base_name: Option<String>,
    pub count: Option<u32>,
    /// Can only lower the configured `bulk_parallelism`
    pub parallelism: Option<usize>,
    pub base_disk: Option<PathBuf>,
    pub iso_image: Option<PathBuf>,
    pub memory_allocation: Option<u32>,
    pub core_allocation: Option<u32>,
    pub disk_size_gb: Option<u32>,
    pub start: bool,
}

impl BulkRequest {
    fn targets(&self) -> Result<Targets, ApiError> {
        if let Some(names) = &self.vm_names {
            if names.is_empty() {
                return Err(ApiError::BadRequest("vm_names must not be empty".to_string()));
            }
            for name in names {
                validate_vm_name(name)?;
            }
            return Ok(Targets::Explicit(names.clone()));
        }

        let base_name = self.base_name.as_deref().ok_or_else(|| {
            ApiError::BadRequest("Either vm_names or base_name is required".to_string())
        })?;
        validate_vm_name(base_name)?;
        match self.count {
            Some(0) => Err(ApiError::BadRequest("count must be at least 1".to_string())),
            Some(count) => Ok(Targets::Numbered { base_name: base_name.to_string(), count }),
            None => Ok(Targets::PrefixGroup(base_name.to_string())),
        }
    }

    fn operation(&self, name: &str) -> Result<BulkOperation, ApiError> {
        match name {
            "create" => {
                if self.vm_names.is_none() && self.count.is_none() {
                    return Err(ApiError::BadRequest(
                        "Bulk create needs vm_names or base_name with count".to_string(),
                    ));
                }
                let base_disk = self.base_disk.clone().ok_or_else(|| {
                    ApiError::BadRequest("Bulk create needs base_disk".to_string())
                })?;
                Ok(BulkOperation::Create(CreateSpec {
                    base_disk,
                    iso_image: self.iso_image.clone(),
                    memory_mb: self.memory_allocation,
                    vcpus: self.core_allocation,
                    disk_size_gb: self.disk_size_gb,
                    start_after_create: self.start,
                }))
            }
            "start" => Ok(BulkOperation::Start),
            "stop" => Ok(BulkOperation::Stop),
            "delete" => Ok(BulkOperation::Delete),
            other => Err(ApiError::BadRequest(format!(
                "Unknown bulk operation '{}'. Valid operations: create, start, stop, delete",
                other
            ))),
        }
    }
}

/// VM names become disk image file names.
fn validate_vm_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("vm_name must not be empty".to_string()));
    }
    if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
        return Err(ApiError::BadRequest(format!("Invalid VM name '{}'", name)));
    }
    Ok(())
}

fn reply(soft: bool, message: impl Into<String>) -> Value {
    json!({
        "status": if soft { "info" } else { "success" },
        "message": message.into(),
    })
}

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    state.health.probe_driver(state.lifecycle.driver().as_ref()).await;
    let health = state.health.get_health().await;
    let ready = state.health.is_ready().await;

    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let status = if ready { "success" } else { "error" };
    (code, Json(json!({ "status": status, "health": health })))
}

pub async fn list_vms(State(state): State<Arc<AppState>>) -> ApiResult {
    let vms = state.lifecycle.list().await?;
    Ok(Json(json!({ "status": "success", "vms": vms })))
}

pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateVmRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    validate_vm_name(&req.vm_name)?;

    let outcome = state.lifecycle.create(&req.vm_name, &req.spec()).await?;
    info!(vm_name = %req.vm_name, detail = %outcome.detail(), "VM created");

    let mut body = reply(false, format!("VM {} {}", req.vm_name, outcome.detail()));
    body["vm"] = json!(outcome);
    Ok(Json(body))
}

pub async fn start_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmNameRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    validate_vm_name(&req.vm_name)?;

    let outcome = state.lifecycle.start(&req.vm_name).await?;
    Ok(Json(reply(outcome.is_noop(), format!("VM {} {}", req.vm_name, outcome.detail()))))
}

pub async fn stop_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmNameRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    validate_vm_name(&req.vm_name)?;

    let outcome = state.lifecycle.stop(&req.vm_name).await?;
    Ok(Json(reply(outcome.is_noop(), format!("VM {} {}", req.vm_name, outcome.detail()))))
}

pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmNameRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    validate_vm_name(&req.vm_name)?;

    let outcome = state.lifecycle.delete(&req.vm_name).await?;
    Ok(Json(reply(false, format!("VM {} {}", req.vm_name, outcome.detail()))))
}

/// Snapshot stats, bounded by `stats_timeout`. A request that times out
/// writes no samples.
pub async fn vm_stats(
    State(state): State<Arc<AppState>>,
    Path(vm_name): Path<String>,
) -> ApiResult {
    validate_vm_name(&vm_name)?;

    let stats = tokio::time::timeout(state.stats_timeout, state.stats.collect(&vm_name))
        .await
        .map_err(|_| ApiError::Timeout {
            vm_name: vm_name.clone(),
            after_secs: state.stats_timeout.as_secs(),
        })??;

    Ok(Json(json!({ "status": "success", "stats": stats })))
}

pub async fn bulk(
    State(state): State<Arc<AppState>>,
    Path(operation): Path<String>,
    payload: Result<Json<BulkRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    let op = req.operation(&operation)?;
    let targets = req.targets()?;

    let report = state.bulk.execute(&op, &targets, req.parallelism).await?;
    let message = format!(
        "{}: {} succeeded, {} failed",
        report.operation,
        report.succeeded.len(),
        report.failed.len()
    );
    let mut body = reply(false, message);
    body["report"] = json!(report);
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_targets() {
        let req = BulkRequest { base_name: Some("web".into()), ..BulkRequest::default() };
        assert_eq!(req.targets().unwrap(), Targets::PrefixGroup("web".into()));

        let req =
            BulkRequest { base_name: Some("web".into()), count: Some(3), ..BulkRequest::default() };
        assert_eq!(req.targets().unwrap(), Targets::Numbered { base_name: "web".into(), count: 3 });

        let req = BulkRequest {
            vm_names: Some(vec!["a".into()]),
            base_name: Some("web".into()),
            ..BulkRequest::default()
        };
        assert_eq!(req.targets().unwrap(), Targets::Explicit(vec!["a".into()]));

        assert!(BulkRequest::default().targets().is_err());
        let req =
            BulkRequest { base_name: Some("web".into()), count: Some(0), ..BulkRequest::default() };
        assert!(req.targets().is_err());
    }

    #[test]
    fn test_bulk_create_requirements() {
        let req = BulkRequest { base_name: Some("web".into()), ..BulkRequest::default() };
        assert!(req.operation("create").is_err());

        let req =
            BulkRequest { base_name: Some("web".into()), count: Some(2), ..BulkRequest::default() };
        assert!(req.operation("create").is_err());

        let req = BulkRequest {
            base_name: Some("web".into()),
            count: Some(2),
            base_disk: Some("/vms/base.qcow2".into()),
            memory_allocation: Some(2048),
            ..BulkRequest::default()
        };
        match req.operation("create").unwrap() {
            BulkOperation::Create(spec) => assert_eq!(spec.memory_mb, Some(2048)),
            other => panic!("unexpected operation {:?}", other),
        }

        assert!(req.operation("reboot").is_err());
        assert_eq!(req.operation("stop").unwrap(), BulkOperation::Stop);
    }

    #[test]
    fn test_vm_name_validation() {
        assert!(validate_vm_name("web_1").is_ok());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name("  ").is_err());
        assert!(validate_vm_name("../etc").is_err());
        assert!(validate_vm_name("..").is_err());
    }
}
