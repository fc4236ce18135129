use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::app::core::Application;
use crate::app::services::{AllocationService, ApplicationServices};
use crate::config::{DaemonArgs, DiscoveryArgs, DiscoverySource};
use crate::core::reservation::ReservationManager;
use crate::platform::discovery::{
    DiscoveryBackend, FallbackBackend, InventoryBackend, RocmSmiBackend, SysfsBackend,
};
use crate::platform::isolation::{CommandIsolationBackend, IsolationConfig, IsolationSessions};
use crate::platform::registry::DeviceRegistry;

/// Build the discovery backend selected on the command line
pub fn discovery_backend(args: &DiscoveryArgs) -> Result<Arc<dyn DiscoveryBackend>> {
    let timeout = Duration::from_millis(args.discovery_timeout_ms.max(1));
    let rocm_smi = || RocmSmiBackend::new(&args.rocm_smi_path, timeout);
    let sysfs = || SysfsBackend::new(&args.sysfs_root);

    let backend: Arc<dyn DiscoveryBackend> = match args.discovery_source {
        DiscoverySource::Auto => Arc::new(FallbackBackend::new(
            Box::new(rocm_smi()),
            Box::new(sysfs()),
        )),
        DiscoverySource::RocmSmi => Arc::new(rocm_smi()),
        DiscoverySource::Sysfs => Arc::new(sysfs()),
        DiscoverySource::Inventory => {
            let path = args
                .inventory_path
                .clone()
                .context("--inventory-path is required for the inventory discovery source")?;
            Arc::new(InventoryBackend::new(path))
        }
    };
    Ok(backend)
}

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build the services and run a first discovery pass
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let backend = discovery_backend(&args.discovery)?;
        let registry = Arc::new(DeviceRegistry::new(backend, args.into()));
        let reservations = Arc::new(ReservationManager::new(args.into()));

        let isolation_config = IsolationConfig::from(args);
        let isolation = isolation_config.is_enabled().then(|| {
            tracing::info!("Process isolation commands configured");
            Arc::new(IsolationSessions::new(Arc::new(CommandIsolationBackend::new(
                isolation_config.clone(),
            ))))
        });

        let mut allocations = AllocationService::new(
            registry.clone(),
            args.into(),
            args.into(),
            reservations.clone(),
            args.unpartitioned_mode,
        );
        if let Some(isolation) = &isolation {
            allocations = allocations.with_isolation(isolation.clone());
        }

        match allocations.refresh_devices().await {
            Ok(summary) => tracing::info!(
                source = %summary.source,
                devices = summary.refreshed,
                failures = summary.failures.len(),
                "initial discovery finished"
            ),
            Err(e) => tracing::warn!("Initial discovery failed, will retry on poll: {}", e),
        }

        let services = ApplicationServices {
            registry,
            allocations: Arc::new(allocations),
            reservations,
            isolation,
        };
        Ok(Application::new(services, self.daemon_args))
    }
}
