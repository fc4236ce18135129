use anyhow::Result;
use api_types::IsolationType;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// The daemon: shared services plus the arguments they were built from
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            devices = self.services.registry.list_devices().len(),
            "starting background loops"
        );

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        tasks
            .wait_for_completion()
            .await
            .inspect_err(|e| tracing::error!("background loop failed: {e}"))?;

        tracing::info!("background loops stopped");
        Ok(())
    }

    /// Release every allocation still holding an isolation session
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("releasing isolated allocations before exit");

        let allocations = &self.services.allocations;
        if let Some(isolation) = &self.services.isolation {
            for device_id in isolation.active_devices() {
                let isolated = allocations
                    .list_allocations(&device_id)
                    .into_iter()
                    .filter(|allocation| allocation.isolation_type == IsolationType::Process);
                for allocation in isolated {
                    if let Err(e) = allocations.release(&allocation.id).await {
                        tracing::warn!("Failed to release {} on shutdown: {:?}", allocation.id, e);
                    }
                }
            }
        }

        tracing::info!("shutdown finished");
        Ok(())
    }
}
