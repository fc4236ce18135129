use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::types::{mib_to_bytes, PartitionConfig};
use crate::platform::discovery::DeviceDescriptor;

/// Static device inventory corresponding to the YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<InventoryDevice>,
}

/// One device entry of the inventory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryDevice {
    pub device_id: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub memory_total_mib: u64,
    #[serde(default)]
    pub memory_used_mib: u64,
    #[serde(default)]
    pub partition: Option<PartitionConfig>,
    #[serde(default)]
    pub temperature_celsius: Option<f64>,
    #[serde(default)]
    pub pci_bus: Option<String>,
}

fn default_model() -> String {
    "unknown".to_string()
}

impl Inventory {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

impl InventoryDevice {
    /// Converts the entry, returning `(device_id, reason)` when it is unusable.
    pub fn into_descriptor(self) -> Result<DeviceDescriptor, (String, String)> {
        if self.device_id.trim().is_empty() {
            return Err((self.device_id, "empty device id".to_string()));
        }
        if self.memory_total_mib == 0 {
            return Err((self.device_id, "memoryTotalMib must be positive".to_string()));
        }
        if let Some(partition) = &self.partition {
            if let Err(report) = partition.validate() {
                return Err((self.device_id, report.current_context().to_string()));
            }
        }

        let mut descriptor = DeviceDescriptor::new(
            self.device_id,
            self.model,
            mib_to_bytes(self.memory_total_mib),
        );
        descriptor.memory_used_bytes = mib_to_bytes(self.memory_used_mib);
        descriptor.temperature_celsius = self.temperature_celsius;
        descriptor.partition = self.partition;
        descriptor.pci_bus = self.pci_bus;
        Ok(descriptor)
    }
}

/// Load the inventory file at `path`
pub async fn load_inventory(path: &Path) -> anyhow::Result<Inventory> {
    tracing::info!("Loading device inventory from {:?}", path);
    let content = tokio::fs::read_to_string(path).await?;
    let inventory = Inventory::from_yaml(&content)?;
    tracing::info!("Loaded {} inventory devices", inventory.devices.len());
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ComputeMode, MemoryMode};

    #[test]
    fn parses_camel_case_entries() {
        let inventory = Inventory::from_yaml(
            r#"
devices:
  - deviceId: card0
    model: MI300X
    memoryTotalMib: 196608
    partition:
      computeMode: CPX
      memoryMode: NPS4
  - deviceId: card1
    memoryTotalMib: 1024
"#,
        )
        .unwrap();

        assert_eq!(inventory.devices.len(), 2);
        assert_eq!(
            inventory.devices[0].partition,
            Some(PartitionConfig::new(ComputeMode::Cpx, MemoryMode::Nps4))
        );
        assert_eq!(inventory.devices[1].model, "unknown");
    }

    #[test]
    fn invalid_partition_is_rejected_per_device() {
        let inventory = Inventory::from_yaml(
            r#"
devices:
  - deviceId: card3
    memoryTotalMib: 1024
    partition:
      computeMode: SPX
      memoryMode: NPS4
"#,
        )
        .unwrap();
        let device = inventory.devices.into_iter().next().unwrap();
        let (device_id, reason) = device.into_descriptor().unwrap_err();
        assert_eq!(device_id, "card3");
        assert!(reason.contains("NPS4"));
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.yaml");
        std::fs::write(&path, "devices: []\n").unwrap();
        assert!(load_inventory(&path).await.unwrap().devices.is_empty());
        assert!(load_inventory(&dir.path().join("missing.yaml")).await.is_err());
    }
}
