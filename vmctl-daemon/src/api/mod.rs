//! HTTP API served by vmctld.

mod error;
mod handlers;

pub use error::ApiError;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use vmctl_core::{BulkCoordinator, Config, HealthChecker, StatsCollector, VmLifecycle};

/// Shared state handed to every handler.
pub struct AppState {
    pub lifecycle: Arc<VmLifecycle>,
    pub bulk: BulkCoordinator,
    pub stats: StatsCollector,
    pub health: HealthChecker,
    pub stats_timeout: Duration,
}

impl AppState {
    pub fn new(
        lifecycle: Arc<VmLifecycle>,
        bulk: BulkCoordinator,
        stats: StatsCollector,
        health: HealthChecker,
        config: &Config,
    ) -> Self {
        Self {
            lifecycle,
            bulk,
            stats,
            health,
            stats_timeout: Duration::from_secs(config.stats_timeout_secs),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/list_vms", get(handlers::list_vms))
        .route("/create_vm", post(handlers::create_vm))
        .route("/start_vm", post(handlers::start_vm))
        .route("/stop_vm", post(handlers::stop_vm))
        .route("/delete_vm", post(handlers::delete_vm))
        .route("/vm_stats/:vm_name", get(handlers::vm_stats))
        .route("/bulk/:operation", post(handlers::bulk))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
