//! Pluggable device discovery.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::{bytes_to_mib, PartitionConfig};

mod fallback;
mod inventory;
mod rocm_smi;
mod sysfs;

pub use fallback::FallbackBackend;
pub use inventory::InventoryBackend;
pub use rocm_smi::RocmSmiBackend;
pub use sysfs::SysfsBackend;

/// Unified error type for discovery backends
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery source unavailable: {message}")]
    Unavailable { message: String },

    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Cannot parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("I/O error on {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Everything discovery reports about one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub model: String,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub utilization_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
    pub power_watts: Option<f64>,
    pub partition: Option<PartitionConfig>,
    pub pci_bus: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        device_id: impl Into<String>,
        model: impl Into<String>,
        memory_total_bytes: u64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            model: model.into(),
            memory_total_bytes,
            memory_used_bytes: 0,
            utilization_percent: None,
            temperature_celsius: None,
            power_watts: None,
            partition: None,
            pci_bus: None,
        }
    }

    pub fn memory_available_bytes(&self) -> u64 {
        self.memory_total_bytes.saturating_sub(self.memory_used_bytes)
    }

    pub fn memory_total_mib(&self) -> u64 {
        bytes_to_mib(self.memory_total_bytes)
    }
}

/// A device discovery could not describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFailure {
    pub device_id: String,
    pub reason: String,
}

/// Result of a whole-node discovery pass.
///
/// Devices that failed to parse are listed in `failures`; they never abort
/// the pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub source: String,
    pub devices: Vec<DeviceDescriptor>,
    pub failures: Vec<DeviceFailure>,
}

impl DiscoveryReport {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub(crate) fn record_failure(&mut self, device_id: impl Into<String>, reason: impl ToString) {
        let failure = DeviceFailure {
            device_id: device_id.into(),
            reason: reason.to_string(),
        };
        tracing::warn!(
            source = %self.source,
            device_id = %failure.device_id,
            reason = %failure.reason,
            "skipping device"
        );
        self.failures.push(failure);
    }

    pub(crate) fn sort(&mut self) {
        self.devices
            .sort_by(|a, b| natural_key(&a.device_id).cmp(&natural_key(&b.device_id)));
    }
}

/// Orders `card2` before `card10`.
pub(crate) fn natural_key(device_id: &str) -> (String, u64) {
    let digits = device_id
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .count();
    let (prefix, number) = device_id.split_at(device_id.len() - digits);
    (prefix.to_string(), number.parse().unwrap_or(0))
}

/// Source of device descriptors
#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Describe every device of the node
    async fn discover(&self) -> DiscoveryResult<DiscoveryReport>;

    /// Describe a single device
    async fn describe(&self, device_id: &str) -> DiscoveryResult<DeviceDescriptor> {
        let report = self.discover().await?;
        if let Some(failure) = report.failures.iter().find(|f| f.device_id == device_id) {
            return Err(DiscoveryError::Parse {
                what: device_id.to_string(),
                message: failure.reason.clone(),
            });
        }
        report
            .devices
            .into_iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| DiscoveryError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Backend serving scripted descriptors, for tests.
    #[derive(Debug, Default)]
    pub(crate) struct StaticBackend {
        pub(crate) devices: Mutex<Vec<DeviceDescriptor>>,
        pub(crate) broken: Mutex<HashMap<String, String>>,
        pub(crate) unavailable: bool,
    }

    impl StaticBackend {
        pub(crate) fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
            Self {
                devices: Mutex::new(devices),
                ..Default::default()
            }
        }

        pub(crate) fn unavailable() -> Self {
            Self {
                unavailable: true,
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl DiscoveryBackend for StaticBackend {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn discover(&self) -> DiscoveryResult<DiscoveryReport> {
            if self.unavailable {
                return Err(DiscoveryError::Unavailable {
                    message: "scripted outage".to_string(),
                });
            }
            let mut report = DiscoveryReport::new(self.name());
            report.devices = self.devices.lock().unwrap().clone();
            for (device_id, reason) in self.broken.lock().unwrap().iter() {
                report.devices.retain(|d| &d.device_id != device_id);
                report.record_failure(device_id.clone(), reason);
            }
            report.sort();
            Ok(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticBackend;
    use super::*;

    #[test]
    fn natural_ordering_of_device_ids() {
        let mut report = DiscoveryReport::new("test");
        for id in ["card10", "card2", "card0"] {
            report.devices.push(DeviceDescriptor::new(id, "gpu", 0));
        }
        report.sort();
        let ids = report
            .devices
            .iter()
            .map(|d| d.device_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["card0", "card2", "card10"]);
    }

    #[tokio::test]
    async fn describe_distinguishes_missing_from_broken() {
        let backend = StaticBackend::with_devices(vec![
            DeviceDescriptor::new("card0", "gpu", 1024),
            DeviceDescriptor::new("card1", "gpu", 1024),
        ]);
        backend
            .broken
            .lock()
            .unwrap()
            .insert("card1".to_string(), "bad vram".to_string());

        assert_eq!(backend.describe("card0").await.unwrap().device_id, "card0");
        assert!(matches!(
            backend.describe("card1").await,
            Err(DiscoveryError::Parse { .. })
        ));
        assert!(matches!(
            backend.describe("card7").await,
            Err(DiscoveryError::DeviceNotFound { .. })
        ));
    }
}
