use std::path::PathBuf;

use super::{DiscoveryBackend, DiscoveryError, DiscoveryReport, DiscoveryResult};
use crate::config::inventory::Inventory;

/// Discovery from a static YAML inventory file.
///
/// The file is re-read on every pass so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct InventoryBackend {
    path: PathBuf,
}

impl InventoryBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for InventoryBackend {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn discover(&self) -> DiscoveryResult<DiscoveryReport> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiscoveryError::Unavailable {
                    message: format!("inventory {} does not exist", self.path.display()),
                })
            }
            Err(error) => {
                return Err(DiscoveryError::Io {
                    path: self.path.clone(),
                    message: error.to_string(),
                })
            }
        };
        let inventory = Inventory::from_yaml(&content).map_err(|error| DiscoveryError::Parse {
            what: self.path.display().to_string(),
            message: error.to_string(),
        })?;

        let mut report = DiscoveryReport::new(self.name());
        for device in inventory.devices {
            match device.into_descriptor() {
                Ok(descriptor) => report.devices.push(descriptor),
                Err((device_id, reason)) => report.record_failure(device_id, reason),
            }
        }
        report.sort();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_inventory_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        std::fs::write(
            &path,
            r#"
devices:
  - deviceId: card1
    model: MI300X
    memoryTotalMib: 196608
  - deviceId: card0
    model: MI300X
    memoryTotalMib: 8192
    partition:
      computeMode: CPX
      memoryMode: NPS4
  - deviceId: card2
    model: broken
    memoryTotalMib: 0
"#,
        )
        .unwrap();

        let report = InventoryBackend::new(&path).discover().await.unwrap();
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.devices[0].device_id, "card0");
        assert_eq!(report.devices[0].memory_total_mib(), 8192);
        assert!(report.devices[0].partition.is_some());
        assert_eq!(report.failures[0].device_id, "card2");
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let backend = InventoryBackend::new("/nonexistent/devices.yaml");
        assert!(matches!(
            backend.discover().await,
            Err(DiscoveryError::Unavailable { .. })
        ));
    }
}
