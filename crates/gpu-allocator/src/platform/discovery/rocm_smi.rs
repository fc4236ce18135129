use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::process::Command;

use super::{DeviceDescriptor, DiscoveryBackend, DiscoveryError, DiscoveryReport, DiscoveryResult};
use crate::core::types::{ComputeMode, MemoryMode, PartitionConfig};

const ARGS: [&str; 9] = [
    "--json",
    "--showproductname",
    "--showmeminfo",
    "vram",
    "--showuse",
    "--showtemp",
    "--showpower",
    "--showcomputepartition",
    "--showmemorypartition",
];

const MODEL_KEYS: [&str; 3] = ["Card series", "Card model", "Card SKU"];
const VRAM_TOTAL_KEYS: [&str; 1] = ["VRAM Total Memory (B)"];
const VRAM_USED_KEYS: [&str; 1] = ["VRAM Total Used Memory (B)"];
const USE_KEYS: [&str; 1] = ["GPU use (%)"];
const TEMPERATURE_KEYS: [&str; 3] = [
    "Temperature (Sensor edge) (C)",
    "Temperature (Sensor junction) (C)",
    "Temperature (Sensor hotspot) (C)",
];
const POWER_KEYS: [&str; 2] = [
    "Average Graphics Package Power (W)",
    "Current Socket Graphics Package Power (W)",
];
const COMPUTE_PARTITION_KEYS: [&str; 2] = ["Compute Partition", "Accelerator Partition"];
const MEMORY_PARTITION_KEYS: [&str; 1] = ["Memory Partition"];

/// Discovery through the vendor `rocm-smi` tool.
///
/// Example expected output:
/// ```json
/// {
///     "card0": {
///         "Card series": "AMD Instinct MI300X",
///         "VRAM Total Memory (B)": "205822885888",
///         "VRAM Total Used Memory (B)": "283496448",
///         "GPU use (%)": "0",
///         "Temperature (Sensor edge) (C)": "35.0",
///         "Current Socket Graphics Package Power (W)": "131.0",
///         "Compute Partition": "CPX",
///         "Memory Partition": "NPS4"
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RocmSmiBackend {
    binary: PathBuf,
    timeout: Duration,
}

impl RocmSmiBackend {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self) -> DiscoveryResult<String> {
        let command = self.binary.display().to_string();
        let mut child = Command::new(&self.binary);
        child.args(ARGS).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, child.output()).await {
            Err(_) => {
                return Err(DiscoveryError::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
            Ok(Err(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiscoveryError::Unavailable {
                    message: format!("{command} is not installed"),
                })
            }
            Ok(Err(error)) => {
                return Err(DiscoveryError::CommandFailed {
                    command,
                    message: error.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(DiscoveryError::CommandFailed {
                command,
                message: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for RocmSmiBackend {
    fn name(&self) -> &'static str {
        "rocm-smi"
    }

    async fn discover(&self) -> DiscoveryResult<DiscoveryReport> {
        let stdout = self.run().await?;
        parse_report(&stdout)
    }
}

pub(crate) fn parse_report(output: &str) -> DiscoveryResult<DiscoveryReport> {
    let cards: BTreeMap<String, Value> =
        serde_json::from_str(output).map_err(|error| DiscoveryError::Parse {
            what: "rocm-smi output".to_string(),
            message: error.to_string(),
        })?;

    let mut report = DiscoveryReport::new("rocm-smi");
    for (device_id, fields) in cards {
        // "system" and other non-card sections
        if !device_id.starts_with("card") {
            continue;
        }
        let parsed = fields
            .as_object()
            .ok_or_else(|| "card entry is not an object".to_string())
            .and_then(|fields| parse_card(&device_id, fields));
        match parsed {
            Ok(descriptor) => report.devices.push(descriptor),
            Err(reason) => report.record_failure(device_id, reason),
        }
    }
    report.sort();
    Ok(report)
}

fn parse_card(device_id: &str, fields: &Map<String, Value>) -> Result<DeviceDescriptor, String> {
    let memory_total_bytes = number::<u64>(fields, &VRAM_TOTAL_KEYS)
        .ok_or_else(|| "missing or invalid VRAM total".to_string())?;
    let model = text(fields, &MODEL_KEYS).unwrap_or("unknown");

    let mut descriptor = DeviceDescriptor::new(device_id, model, memory_total_bytes);
    descriptor.memory_used_bytes = number(fields, &VRAM_USED_KEYS).unwrap_or(0);
    descriptor.utilization_percent = number(fields, &USE_KEYS);
    descriptor.temperature_celsius = number(fields, &TEMPERATURE_KEYS);
    descriptor.power_watts = number(fields, &POWER_KEYS);
    descriptor.pci_bus = text(fields, &["PCI Bus"]).map(str::to_string);
    descriptor.partition = partition(fields)?;
    Ok(descriptor)
}

/// A mode this engine cannot allocate fails the card instead of leaving it
/// unpartitioned.
fn partition(fields: &Map<String, Value>) -> Result<Option<PartitionConfig>, String> {
    let Some(compute) = text(fields, &COMPUTE_PARTITION_KEYS) else {
        return Ok(None);
    };
    let compute = compute
        .parse::<ComputeMode>()
        .map_err(|e| e.current_context().to_string())?;
    let memory = match text(fields, &MEMORY_PARTITION_KEYS) {
        Some(value) => value
            .parse::<MemoryMode>()
            .map_err(|e| e.current_context().to_string())?,
        None => MemoryMode::Nps1,
    };
    Ok(Some(PartitionConfig::new(compute, memory)))
}

fn text<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| fields.get(*key)?.as_str())
        .map(str::trim)
        .find(|value| !value.is_empty() && *value != "N/A")
}

fn number<T: std::str::FromStr>(fields: &Map<String, Value>, keys: &[&str]) -> Option<T> {
    keys.iter().find_map(|key| match fields.get(*key)? {
        Value::String(value) => value.trim().parse().ok(),
        Value::Number(value) => value.to_string().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const OUTPUT: &str = r#"{
        "card0": {
            "Card series": "AMD Instinct MI300X",
            "VRAM Total Memory (B)": "205822885888",
            "VRAM Total Used Memory (B)": "283496448",
            "GPU use (%)": "12",
            "Temperature (Sensor edge) (C)": "N/A",
            "Temperature (Sensor junction) (C)": "41.0",
            "Current Socket Graphics Package Power (W)": "131.0",
            "Compute Partition": "CPX",
            "Memory Partition": "NPS4",
            "PCI Bus": "0000:0C:00.0"
        },
        "card10": {
            "Card series": "AMD Instinct MI300X",
            "VRAM Total Memory (B)": "205822885888",
            "Compute Partition": "N/A"
        },
        "card2": {
            "Card series": "AMD Instinct MI300X",
            "VRAM Total Memory (B)": "garbage"
        },
        "card3": {
            "Card series": "AMD Instinct MI300X",
            "VRAM Total Memory (B)": "205822885888",
            "Compute Partition": "DPX",
            "Memory Partition": "NPS2"
        },
        "system": {"Driver version": "6.7.0"}
    }"#;

    #[test]
    fn parses_cards_and_degrades_per_device() {
        let report = parse_report(OUTPUT).unwrap();
        let ids = report
            .devices
            .iter()
            .map(|d| d.device_id.clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["card0".to_string(), "card10".to_string()]);
        let failed = report
            .failures
            .iter()
            .map(|f| f.device_id.clone())
            .collect::<Vec<_>>();
        assert_eq!(failed, vec!["card2".to_string(), "card3".to_string()]);
        assert!(report.failures[1].reason.contains("DPX"));

        let card0 = &report.devices[0];
        assert_eq!(card0.memory_total_bytes, 205_822_885_888);
        assert_eq!(card0.memory_used_bytes, 283_496_448);
        assert_eq!(card0.utilization_percent, Some(12.0));
        assert_eq!(card0.temperature_celsius, Some(41.0));
        assert_eq!(card0.power_watts, Some(131.0));
        assert_eq!(
            card0.partition,
            Some(PartitionConfig::new(ComputeMode::Cpx, MemoryMode::Nps4))
        );

        let card10 = &report.devices[1];
        assert_eq!(card10.partition, None);
        assert_eq!(card10.temperature_celsius, None);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        assert!(matches!(
            parse_report("WARNING: No AMD GPUs specified"),
            Err(DiscoveryError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let backend = RocmSmiBackend::new("/nonexistent/rocm-smi", Duration::from_secs(1));
        assert!(matches!(
            backend.discover().await,
            Err(DiscoveryError::Unavailable { .. })
        ));
    }
}
