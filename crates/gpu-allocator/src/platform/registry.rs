//! Discovered devices and their availability.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use error_stack::report;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::discovery::{
    natural_key, DeviceDescriptor, DeviceFailure, DiscoveryBackend, DiscoveryResult,
};
use crate::core::error::{AllocationError, Result};
use crate::core::lock;
use crate::core::types::PartitionConfig;

pub const DEFAULT_TEMPERATURE_LIMIT_CELSIUS: f64 = 90.0;
pub const DEFAULT_MAX_ALLOCATIONS_PER_DEVICE: usize = 16;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Devices hotter than this are unavailable.
    pub temperature_limit_celsius: f64,
    /// Devices with this many live allocations are unavailable.
    pub max_allocations_per_device: usize,
    pub poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            temperature_limit_celsius: DEFAULT_TEMPERATURE_LIMIT_CELSIUS,
            max_allocations_per_device: DEFAULT_MAX_ALLOCATIONS_PER_DEVICE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A device as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
    pub active_allocations: usize,
    pub is_available: bool,
    /// Not reported by the last discovery pass but still holding allocations.
    pub missing: bool,
    pub last_refresh: DateTime<Utc>,
}

impl Device {
    fn new(descriptor: DeviceDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            descriptor,
            active_allocations: 0,
            is_available: false,
            missing: false,
            last_refresh: now,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.descriptor.device_id
    }

    pub fn partition(&self) -> Option<PartitionConfig> {
        self.descriptor.partition
    }

    pub fn memory_total_mib(&self) -> u64 {
        self.descriptor.memory_total_mib()
    }

    fn recompute(&mut self, config: &RegistryConfig) {
        let cool = self
            .descriptor
            .temperature_celsius
            .map_or(true, |celsius| celsius <= config.temperature_limit_celsius);
        self.is_available =
            !self.missing && cool && self.active_allocations < config.max_allocations_per_device;
    }
}

/// What a whole-node refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub source: String,
    pub refreshed: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub failures: Vec<DeviceFailure>,
}

/// Registry of the devices of this node.
///
/// Discovery I/O always completes before any entry is touched, so no map
/// guard is ever held across an `.await`.
pub struct DeviceRegistry {
    backend: Arc<dyn DiscoveryBackend>,
    config: RegistryConfig,
    devices: DashMap<String, Device>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, config: RegistryConfig) -> Self {
        Self {
            backend,
            config,
            devices: DashMap::new(),
            subscribers: Mutex::default(),
        }
    }

    /// Receive a notification after every successful whole-node refresh.
    ///
    /// Notifications coalesce: a slow receiver sees one pending wake-up, not
    /// one per refresh.
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (sender, receiver) = mpsc::channel(1);
        lock::lock(&self.subscribers).push(sender);
        receiver
    }

    fn notify_subscribers(&self) {
        lock::lock(&self.subscribers).retain(|sender| match sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => {
                tracing::debug!("Subscriber disconnected, cleaning up channel");
                false
            }
        });
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Every known device, in natural id order.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices = self
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        devices.sort_by_cached_key(|device| natural_key(device.device_id()));
        devices
    }

    pub fn get_device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .get(device_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))
    }

    pub fn partition_config(&self, device_id: &str) -> Option<PartitionConfig> {
        self.devices.get(device_id).and_then(|entry| entry.partition())
    }

    pub fn is_available(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|entry| entry.is_available)
    }

    /// Record the live allocation count of a device and recompute availability.
    pub fn set_active_allocations(&self, device_id: &str, count: usize) -> Result<()> {
        let mut entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))?;
        entry.active_allocations = count;
        entry.recompute(&self.config);
        Ok(())
    }

    /// Re-describe a single device.
    pub async fn refresh_device(&self, device_id: &str) -> DiscoveryResult<Device> {
        let descriptor = self.backend.describe(device_id).await?;
        Ok(self.upsert(descriptor, Utc::now()).0)
    }

    /// Re-discover every device of the node.
    ///
    /// Devices the backend failed to describe keep their last known entry.
    /// Devices that disappeared are dropped, unless they still hold
    /// allocations, in which case they stay as `missing` and unavailable.
    #[tracing::instrument(skip(self), fields(source = self.backend.name()))]
    pub async fn refresh_all(&self) -> DiscoveryResult<RefreshSummary> {
        let report = self.backend.discover().await?;
        let now = Utc::now();

        let mut summary = RefreshSummary {
            source: report.source,
            failures: report.failures,
            ..Default::default()
        };
        let mut seen = summary
            .failures
            .iter()
            .map(|failure| failure.device_id.clone())
            .collect::<Vec<_>>();

        for descriptor in report.devices {
            let device_id = descriptor.device_id.clone();
            let (_, added) = self.upsert(descriptor, now);
            if added {
                tracing::info!(device_id = %device_id, "device discovered");
                summary.added.push(device_id.clone());
            }
            summary.refreshed += 1;
            seen.push(device_id);
        }

        self.devices.retain(|device_id, device| {
            if seen.contains(device_id) {
                return true;
            }
            if device.active_allocations == 0 {
                tracing::warn!(device_id = %device_id, "device vanished, removing it");
                summary.removed.push(device_id.clone());
                return false;
            }
            if !device.missing {
                tracing::warn!(
                    device_id = %device_id,
                    active_allocations = device.active_allocations,
                    "device vanished while allocations are live"
                );
            }
            device.missing = true;
            device.recompute(&self.config);
            true
        });
        summary.removed.sort_by_cached_key(|device_id| natural_key(device_id));

        tracing::debug!(
            refreshed = summary.refreshed,
            failed = summary.failures.len(),
            "device refresh finished"
        );
        self.notify_subscribers();
        Ok(summary)
    }

    /// Poll discovery every `poll_interval` until cancelled.
    pub async fn run(&self, poll_interval: Duration, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("device registry shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh_all().await {
                        tracing::warn!("Failed to refresh devices: {}", e);
                    }
                }
            }
        }
    }

    /// Returns the stored device and whether it was new.
    fn upsert(&self, descriptor: DeviceDescriptor, now: DateTime<Utc>) -> (Device, bool) {
        let mut added = false;
        let mut entry = self
            .devices
            .entry(descriptor.device_id.clone())
            .or_insert_with(|| {
                added = true;
                Device::new(descriptor.clone(), now)
            });
        entry.descriptor = descriptor;
        entry.missing = false;
        entry.last_refresh = now;
        entry.recompute(&self.config);
        (entry.value().clone(), added)
    }
}
