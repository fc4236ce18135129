use std::path::{Path, PathBuf};

use super::{DeviceDescriptor, DiscoveryBackend, DiscoveryError, DiscoveryReport, DiscoveryResult};
use crate::core::types::{ComputeMode, MemoryMode, PartitionConfig};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/drm";

/// Discovery from the DRM pseudo-filesystem.
///
/// Reads `<root>/cardN/device/*` attribute files. A card without a readable
/// `mem_info_vram_total` is reported as a failure, other attributes are
/// optional.
#[derive(Debug, Clone)]
pub struct SysfsBackend {
    root: PathBuf,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn card_ids(&self) -> DiscoveryResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(DiscoveryError::Unavailable {
                    message: format!("{} does not exist", self.root.display()),
                })
            }
            Err(error) => return Err(io_error(&self.root, error)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| io_error(&self.root, error))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_card_name(&name) {
                ids.push(name);
            }
        }
        Ok(ids)
    }

    async fn read_card(&self, device_id: &str) -> DiscoveryResult<DeviceDescriptor> {
        let device_dir = self.root.join(device_id).join("device");
        if !tokio::fs::try_exists(&device_dir).await.unwrap_or(false) {
            return Err(DiscoveryError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }

        let total_path = device_dir.join("mem_info_vram_total");
        let memory_total_bytes = read_number::<u64>(&total_path).await?;
        let model = read_attribute(&device_dir.join("product_name"))
            .await
            .unwrap_or_else(|| "unknown".to_string());

        let mut descriptor = DeviceDescriptor::new(device_id, model, memory_total_bytes);
        descriptor.memory_used_bytes = read_number(&device_dir.join("mem_info_vram_used"))
            .await
            .unwrap_or(0);
        descriptor.utilization_percent = read_number(&device_dir.join("gpu_busy_percent"))
            .await
            .ok();
        descriptor.partition = read_partition(&device_dir).await?;

        if let Some(hwmon) = first_hwmon(&device_dir).await {
            descriptor.temperature_celsius = read_number::<f64>(&hwmon.join("temp1_input"))
                .await
                .ok()
                .map(|millidegrees| millidegrees / 1000.0);
            let power = match read_number::<f64>(&hwmon.join("power1_average")).await {
                Ok(power) => Ok(power),
                Err(_) => read_number::<f64>(&hwmon.join("power1_input")).await,
            };
            descriptor.power_watts = power.ok().map(|microwatts| microwatts / 1_000_000.0);
        }
        descriptor.pci_bus = tokio::fs::canonicalize(&device_dir)
            .await
            .ok()
            .and_then(|path| Some(path.file_name()?.to_string_lossy().into_owned()));
        Ok(descriptor)
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for SysfsBackend {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    async fn discover(&self) -> DiscoveryResult<DiscoveryReport> {
        let mut report = DiscoveryReport::new(self.name());
        for device_id in self.card_ids().await? {
            match self.read_card(&device_id).await {
                Ok(descriptor) => report.devices.push(descriptor),
                // connectors and render nodes without a device directory
                Err(DiscoveryError::DeviceNotFound { .. }) => {}
                Err(error) => report.record_failure(device_id, error),
            }
        }
        report.sort();
        Ok(report)
    }

    async fn describe(&self, device_id: &str) -> DiscoveryResult<DeviceDescriptor> {
        if !is_card_name(device_id) {
            return Err(DiscoveryError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }
        self.read_card(device_id).await
    }
}

/// `card0` but not `card0-DP-1`.
fn is_card_name(name: &str) -> bool {
    name.strip_prefix("card")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn io_error(path: &Path, error: std::io::Error) -> DiscoveryError {
    DiscoveryError::Io {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

async fn read_attribute(path: &Path) -> Option<String> {
    let value = tokio::fs::read_to_string(path).await.ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

async fn read_number<T: std::str::FromStr>(path: &Path) -> DiscoveryResult<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|error| io_error(path, error))?;
    raw.trim().parse().map_err(|_| DiscoveryError::Parse {
        what: path.display().to_string(),
        message: format!("`{}` is not a number", raw.trim()),
    })
}

async fn read_partition(device_dir: &Path) -> DiscoveryResult<Option<PartitionConfig>> {
    let compute_path = device_dir.join("current_compute_partition");
    let Some(compute) = read_attribute(&compute_path).await else {
        return Ok(None);
    };
    let compute = compute
        .parse::<ComputeMode>()
        .map_err(|e| partition_error(&compute_path, e.current_context()))?;

    let memory_path = device_dir.join("current_memory_partition");
    let memory = match read_attribute(&memory_path).await {
        Some(value) => value
            .parse::<MemoryMode>()
            .map_err(|e| partition_error(&memory_path, e.current_context()))?,
        None => MemoryMode::Nps1,
    };
    Ok(Some(PartitionConfig::new(compute, memory)))
}

fn partition_error(path: &Path, reason: impl ToString) -> DiscoveryError {
    DiscoveryError::Parse {
        what: path.display().to_string(),
        message: reason.to_string(),
    }
}

async fn first_hwmon(device_dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(device_dir.join("hwmon")).await.ok()?;
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        found.push(entry.path());
    }
    found.sort();
    found.into_iter().next()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fixture() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "card0/device/mem_info_vram_total", "8589934592\n");
        write(root, "card0/device/mem_info_vram_used", "1073741824\n");
        write(root, "card0/device/gpu_busy_percent", "37\n");
        write(root, "card0/device/product_name", "Instinct MI300X\n");
        write(root, "card0/device/current_compute_partition", "CPX\n");
        write(root, "card0/device/current_memory_partition", "NPS4\n");
        write(root, "card0/device/hwmon/hwmon3/temp1_input", "45000\n");
        write(root, "card0/device/hwmon/hwmon3/power1_average", "150000000\n");

        write(root, "card1/device/mem_info_vram_total", "not-a-number\n");
        write(root, "card2/device/mem_info_vram_total", "4294967296\n");
        write(root, "card3/device/mem_info_vram_total", "4294967296\n");
        write(root, "card3/device/current_compute_partition", "QPX\n");
        fs::create_dir_all(root.join("card0-DP-1")).unwrap();
        fs::create_dir_all(root.join("renderD128")).unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_attribute_files() {
        let dir = fixture();
        let backend = SysfsBackend::new(dir.path());
        let report = backend.discover().await.unwrap();

        let ids = report
            .devices
            .iter()
            .map(|d| d.device_id.clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["card0".to_string(), "card2".to_string()]);
        let mut failed = report
            .failures
            .iter()
            .map(|f| f.device_id.clone())
            .collect::<Vec<_>>();
        failed.sort();
        assert_eq!(failed, vec!["card1".to_string(), "card3".to_string()]);
        assert!(report
            .failures
            .iter()
            .any(|f| f.device_id == "card3" && f.reason.contains("QPX")));

        let card0 = &report.devices[0];
        assert_eq!(card0.model, "Instinct MI300X".to_string());
        assert_eq!(card0.memory_total_mib(), 8192);
        assert_eq!(card0.memory_available_bytes(), 7 * 1024 * 1024 * 1024_u64);
        assert_eq!(card0.utilization_percent, Some(37.0));
        assert_eq!(card0.temperature_celsius, Some(45.0));
        assert_eq!(card0.power_watts, Some(150.0));
        assert_eq!(
            card0.partition,
            Some(PartitionConfig::new(ComputeMode::Cpx, MemoryMode::Nps4))
        );

        let card2 = &report.devices[1];
        assert_eq!(card2.partition, None);
        assert_eq!(card2.temperature_celsius, None);
    }

    #[tokio::test]
    async fn describe_single_card() {
        let dir = fixture();
        let backend = SysfsBackend::new(dir.path());
        assert_eq!(
            backend.describe("card2").await.unwrap().memory_total_mib(),
            4096
        );
        assert!(matches!(
            backend.describe("card1").await,
            Err(DiscoveryError::Parse { .. })
        ));
        assert!(matches!(
            backend.describe("card3").await,
            Err(DiscoveryError::Parse { .. })
        ));
        assert!(matches!(
            backend.describe("card9").await,
            Err(DiscoveryError::DeviceNotFound { .. })
        ));
        assert!(matches!(
            backend.describe("card0-DP-1").await,
            Err(DiscoveryError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn missing_root_is_unavailable() {
        let backend = SysfsBackend::new("/nonexistent/drm");
        assert!(matches!(
            backend.discover().await,
            Err(DiscoveryError::Unavailable { .. })
        ));
    }

    #[test]
    fn card_names() {
        assert!(is_card_name("card0"));
        assert!(is_card_name("card12"));
        assert!(!is_card_name("card"));
        assert!(!is_card_name("card0-HDMI-A-1"));
        assert!(!is_card_name("renderD128"));
    }
}
