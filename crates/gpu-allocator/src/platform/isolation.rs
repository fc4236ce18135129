//! Process-isolation sessions kept per device.
//!
//! The isolation server itself is external. This module only decides when a
//! session has to exist and invokes the backend accordingly.

use core::error::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use derive_more::Display;
use error_stack::{report, Report};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::lock;
use crate::util::keyed_lock::KeyedAsyncLock;

pub const DEFAULT_ISOLATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[display("isolation command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[display("isolation command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[display("isolation {action} is not configured")]
    NotConfigured { action: &'static str },
}

impl Error for IsolationError {}

pub type IsolationResult<T> = Result<T, Report<IsolationError>>;

/// External isolation server, addressed by device id.
#[async_trait::async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, device_id: &str) -> IsolationResult<()>;

    async fn stop(&self, device_id: &str) -> IsolationResult<()>;

    /// `Ok(false)` means the session exists but should be restarted.
    async fn health(&self, device_id: &str) -> IsolationResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationConfig {
    /// Command line started per device, the device id is appended.
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
    pub health_command: Option<String>,
    pub timeout: Duration,
    pub health_interval: Duration,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            start_command: None,
            stop_command: None,
            health_command: None,
            timeout: DEFAULT_ISOLATION_TIMEOUT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

impl IsolationConfig {
    pub fn is_enabled(&self) -> bool {
        self.start_command.is_some()
    }
}

/// Runs configured shell-free command lines with a bounded timeout.
#[derive(Debug, Clone)]
pub struct CommandIsolationBackend {
    config: IsolationConfig,
}

impl CommandIsolationBackend {
    pub fn new(config: IsolationConfig) -> Self {
        Self { config }
    }

    /// Returns whether the command exited successfully.
    async fn run(
        &self,
        action: &'static str,
        command_line: Option<&str>,
        device_id: &str,
    ) -> IsolationResult<bool> {
        let command_line =
            command_line.ok_or_else(|| report!(IsolationError::NotConfigured { action }))?;
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| report!(IsolationError::NotConfigured { action }))?;

        let mut command = Command::new(program);
        command.args(parts).arg(device_id).kill_on_drop(true);

        let status = match tokio::time::timeout(self.config.timeout, command.status()).await {
            Err(_) => {
                return Err(report!(IsolationError::Timeout {
                    command: command_line.to_string(),
                    timeout: self.config.timeout,
                }))
            }
            Ok(Err(error)) => {
                return Err(report!(IsolationError::CommandFailed {
                    command: command_line.to_string(),
                    message: error.to_string(),
                }))
            }
            Ok(Ok(status)) => status,
        };
        tracing::debug!(action, device_id, %status, "isolation command finished");
        Ok(status.success())
    }

    async fn run_checked(
        &self,
        action: &'static str,
        command_line: Option<&str>,
        device_id: &str,
    ) -> IsolationResult<()> {
        if self.run(action, command_line, device_id).await? {
            return Ok(());
        }
        Err(report!(IsolationError::CommandFailed {
            command: command_line.unwrap_or_default().to_string(),
            message: "non-zero exit status".to_string(),
        })
        .attach_printable(format!("device: {device_id}")))
    }
}

#[async_trait::async_trait]
impl IsolationBackend for CommandIsolationBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn start(&self, device_id: &str) -> IsolationResult<()> {
        self.run_checked("start", self.config.start_command.as_deref(), device_id)
            .await
    }

    async fn stop(&self, device_id: &str) -> IsolationResult<()> {
        match self.config.stop_command.as_deref() {
            Some(command_line) => self.run_checked("stop", Some(command_line), device_id).await,
            None => Ok(()),
        }
    }

    async fn health(&self, device_id: &str) -> IsolationResult<bool> {
        match self.config.health_command.as_deref() {
            Some(command_line) => self.run("health", Some(command_line), device_id).await,
            None => Ok(true),
        }
    }
}

/// Reference-counted sessions: the first process-isolated allocation on a
/// device starts the session, the last release stops it.
///
/// Backend calls for one device are serialized; the refcount lock is never
/// held across a backend call.
pub struct IsolationSessions {
    backend: Arc<dyn IsolationBackend>,
    sessions: Mutex<HashMap<String, usize>>,
    device_locks: KeyedAsyncLock<String>,
}

impl IsolationSessions {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            backend,
            sessions: Mutex::default(),
            device_locks: KeyedAsyncLock::new(),
        }
    }

    /// Number of allocations holding the session of `device_id`.
    pub fn session_count(&self, device_id: &str) -> usize {
        lock::lock(&self.sessions)
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Devices with a running session, sorted.
    pub fn active_devices(&self) -> Vec<String> {
        let mut devices = lock::lock(&self.sessions).keys().cloned().collect::<Vec<_>>();
        devices.sort();
        devices
    }

    pub async fn acquire(&self, device_id: &str) -> IsolationResult<()> {
        let _guard = self.device_locks.lock(&device_id.to_string()).await;
        if self.session_count(device_id) == 0 {
            self.backend.start(device_id).await?;
            tracing::info!(device_id, backend = self.backend.name(), "isolation session started");
        }
        *lock::lock(&self.sessions)
            .entry(device_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    /// Drops one reference. Releasing a device without a session is a no-op.
    pub async fn release(&self, device_id: &str) -> IsolationResult<()> {
        let _guard = self.device_locks.lock(&device_id.to_string()).await;
        let remaining = {
            let mut sessions = lock::lock(&self.sessions);
            let Some(count) = sessions.get_mut(device_id) else {
                return Ok(());
            };
            *count -= 1;
            let remaining = *count;
            if remaining == 0 {
                sessions.remove(device_id);
            }
            remaining
        };
        if remaining == 0 {
            self.backend.stop(device_id).await?;
            tracing::info!(device_id, backend = self.backend.name(), "isolation session stopped");
        }
        Ok(())
    }

    /// Restarts sessions the backend reports unhealthy, returning their devices.
    pub async fn check_health(&self) -> Vec<String> {
        let mut restarted = Vec::new();
        for device_id in self.active_devices() {
            let _guard = self.device_locks.lock(&device_id).await;
            if self.session_count(&device_id) == 0 {
                continue;
            }
            let healthy = match self.backend.health(&device_id).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    tracing::warn!(device_id = %device_id, "isolation health check failed: {:?}", e);
                    false
                }
            };
            if healthy {
                continue;
            }

            if let Err(e) = self.backend.stop(&device_id).await {
                tracing::debug!(device_id = %device_id, "stopping unhealthy session failed: {:?}", e);
            }
            match self.backend.start(&device_id).await {
                Ok(()) => {
                    tracing::warn!(device_id = %device_id, "restarted unhealthy isolation session");
                    restarted.push(device_id);
                }
                Err(e) => {
                    tracing::error!(device_id = %device_id, "failed to restart isolation session: {:?}", e);
                }
            }
        }
        restarted
    }

    pub async fn run(&self, health_interval: Duration, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("isolation health loop shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.check_health().await;
                }
            }
        }
    }
}
