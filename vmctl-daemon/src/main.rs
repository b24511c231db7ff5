use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};
use vmctl_core::observability::health::{SUBSYSTEM_DAEMON, SUBSYSTEM_DRIVER};
use vmctl_core::sampling::{InterfaceResolver, RateEngine, SystemClock};
use vmctl_core::{
    init_observability, shutdown_observability, BulkCoordinator, Config, DriverFactory,
    HealthChecker, InMemorySampleStore, QemuImgProvisioner, StatsCollector, VmLifecycle,
};

mod api;
mod shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize observability FIRST
    init_observability(&config.log_level, Some(config.metrics_port))?;

    info!(driver = %config.driver, listen_addr = %config.listen_addr, "vmctld starting");

    let health = HealthChecker::new();
    health.register_subsystem(SUBSYSTEM_DAEMON).await;
    health.register_subsystem(SUBSYSTEM_DRIVER).await;

    let driver = match DriverFactory::create(&config) {
        Ok(driver) => {
            info!(driver = driver.name(), "Hypervisor driver initialized");
            driver
        }
        Err(e) => {
            error!("Failed to create hypervisor driver: {}", e);
            shutdown_observability();
            return Err(e).context("Hypervisor driver initialization failed");
        }
    };
    health.probe_driver(driver.as_ref()).await;

    let samples = Arc::new(InMemorySampleStore::new());
    let provisioner = Arc::new(QemuImgProvisioner::new(config.provision_mode));
    let lifecycle = Arc::new(
        VmLifecycle::new(driver.clone(), provisioner, config.clone())
            .with_sample_store(samples.clone()),
    );
    let bulk = BulkCoordinator::new(lifecycle.clone(), config.bulk_parallelism);
    let stats = StatsCollector::new(
        driver.clone(),
        InterfaceResolver::new(driver.clone(), config.fallback_interface.clone()),
        RateEngine::new(samples),
        Arc::new(SystemClock),
    );

    let state = Arc::new(api::AppState::new(lifecycle, bulk, stats, health, &config));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "vmctld ready");

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown::signal())
        .await;

    info!("vmctld shutting down");
    shutdown_observability();
    served.context("HTTP server failed")
}
