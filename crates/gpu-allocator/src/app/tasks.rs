use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::app::services::AllocationService;

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let args = app.daemon_args();

        let device_sync_task = self.spawn_device_sync_task(app);
        self.tasks.push(device_sync_task);

        let registry_task = {
            let registry = app.services().registry.clone();
            let poll_interval = registry.config().poll_interval;
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting device registry poll task");
                registry.run(poll_interval, token).await;
                tracing::info!("Device registry poll task completed");
            })
        };
        self.tasks.push(registry_task);

        let expiry_task = self.spawn_allocation_expiry_task(
            app.services().allocations.clone(),
            Duration::from_secs(args.allocation_sweep_interval_secs.max(1)),
        );
        self.tasks.push(expiry_task);

        let reservation_task = {
            let reservations = app.services().reservations.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("Starting reservation sweep task");
                reservations.run(token).await;
                tracing::info!("Reservation sweep task completed");
            })
        };
        self.tasks.push(reservation_task);

        let rotation_task = self.spawn_rotation_task(
            app.services().allocations.clone(),
            Duration::from_millis(args.rotation_interval_ms.max(1)),
        );
        self.tasks.push(rotation_task);

        if let Some(isolation) = app.services().isolation.clone() {
            let health_interval = Duration::from_secs(args.isolation_health_interval_secs.max(1));
            let token = self.cancellation_token.clone();
            self.tasks.push(tokio::spawn(async move {
                tracing::info!("Starting isolation health task");
                isolation.run(health_interval, token).await;
                tracing::info!("Isolation health task completed");
            }));
        }
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(Duration::from_secs(30)).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    /// Reconcile the allocators after every registry refresh
    fn spawn_device_sync_task(&self, app: &Application) -> JoinHandle<()> {
        let allocations = app.services().allocations.clone();
        let receiver = app.services().registry.subscribe();
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting device sync task");
            run_device_sync(allocations, receiver, token).await;
            tracing::info!("Device sync task completed");
        })
    }

    fn spawn_allocation_expiry_task(
        &self,
        allocations: Arc<AllocationService>,
        sweep_interval: Duration,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting allocation expiry task");
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        allocations.cleanup_expired().await;
                    }
                }
            }
            tracing::info!("Allocation expiry task completed");
        })
    }

    /// Drives time-slice rotation, the scheduler itself never wakes up
    fn spawn_rotation_task(
        &self,
        allocations: Arc<AllocationService>,
        rotation_interval: Duration,
    ) -> JoinHandle<()> {
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tracing::info!("Starting time-slice rotation task");
            let mut interval = tokio::time::interval(rotation_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        allocations.update_scheduling();
                    }
                }
            }
            tracing::info!("Time-slice rotation task completed");
        })
    }
}

async fn run_device_sync(
    allocations: Arc<AllocationService>,
    mut receiver: mpsc::Receiver<()>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            notification = receiver.recv() => {
                if notification.is_none() {
                    tracing::info!("Registry notifications closed");
                    break;
                }
                let rejected = allocations.sync_devices();
                if !rejected.is_empty() {
                    tracing::warn!(devices = ?rejected, "devices kept their previous configuration");
                }
            }
        }
    }
}
