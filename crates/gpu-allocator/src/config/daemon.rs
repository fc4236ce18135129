use std::path::PathBuf;

use api_types::IsolationType;
use clap::{Parser, ValueEnum};

use crate::core::reservation::ConflictPolicy;
use crate::core::scheduler::DEFAULT_DEVICE_MEMORY_MIB;

/// Where device descriptors come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DiscoverySource {
    /// rocm-smi, falling back to sysfs when the tool is missing
    #[default]
    Auto,
    RocmSmi,
    Sysfs,
    /// Static YAML inventory
    Inventory,
}

/// How devices without hardware partitioning are shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UnpartitionedMode {
    /// Capacity accounting only
    #[default]
    Fractional,
    /// Cooperative turn-taking
    TimeSliced,
}

#[derive(Parser, Clone, Debug)]
pub struct DiscoveryArgs {
    #[arg(
        long,
        env = "GPU_DISCOVERY_SOURCE",
        value_enum,
        default_value_t = DiscoverySource::Auto,
        help = "Device discovery backend"
    )]
    pub discovery_source: DiscoverySource,

    #[arg(
        long,
        env = "ROCM_SMI_PATH",
        default_value = "rocm-smi",
        value_hint = clap::ValueHint::ExecutablePath,
        help = "Path of the rocm-smi executable"
    )]
    pub rocm_smi_path: PathBuf,

    #[arg(
        long,
        env = "GPU_SYSFS_ROOT",
        default_value = "/sys/class/drm",
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the DRM sysfs tree"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        env = "GPU_INVENTORY_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML device inventory, required by the inventory discovery source"
    )]
    pub inventory_path: Option<PathBuf>,

    #[arg(
        long,
        env = "GPU_DISCOVERY_TIMEOUT_MS",
        default_value = "10000",
        help = "Timeout of one discovery command in milliseconds"
    )]
    pub discovery_timeout_ms: u64,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[arg(
        long,
        env = "GPU_POLL_INTERVAL_SECS",
        default_value = "30",
        help = "Device telemetry poll interval in seconds"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        env = "GPU_TEMPERATURE_LIMIT",
        default_value = "90.0",
        help = "Devices hotter than this (Celsius) are not allocatable"
    )]
    pub temperature_limit: f64,

    #[arg(
        long,
        env = "GPU_MAX_ALLOCATIONS_PER_DEVICE",
        default_value = "16",
        help = "Devices holding this many allocations are not allocatable"
    )]
    pub max_allocations_per_device: usize,

    #[arg(
        long,
        env = "GPU_UNPARTITIONED_MODE",
        value_enum,
        default_value_t = UnpartitionedMode::Fractional,
        help = "Sharing mode of devices without a partition configuration"
    )]
    pub unpartitioned_mode: UnpartitionedMode,

    #[arg(
        long,
        env = "GPU_TIME_SLICE_MS",
        default_value = "100",
        help = "Time slice of the time-slicing scheduler in milliseconds"
    )]
    pub time_slice_ms: u64,

    #[arg(
        long,
        env = "GPU_DEFAULT_MEMORY_MIB",
        default_value_t = DEFAULT_DEVICE_MEMORY_MIB,
        help = "Memory capacity assumed for time-sliced devices with unknown memory"
    )]
    pub default_memory_mib: u64,

    #[arg(
        long,
        env = "GPU_ROTATION_INTERVAL_MS",
        default_value = "50",
        help = "How often the time-slice rotation driver runs, in milliseconds"
    )]
    pub rotation_interval_ms: u64,

    #[arg(
        long,
        env = "GPU_ALLOCATION_SWEEP_INTERVAL_SECS",
        default_value = "30",
        help = "Expired allocation sweep interval in seconds"
    )]
    pub allocation_sweep_interval_secs: u64,

    #[arg(
        long,
        env = "GPU_SHARING_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Allow workloads to request co-tenancy"
    )]
    pub sharing_enabled: bool,

    #[arg(
        long,
        env = "GPU_MIN_FRACTION",
        default_value = "0.1",
        help = "Smallest fraction a workload may request"
    )]
    pub min_fraction: f64,

    #[arg(
        long,
        env = "GPU_MAX_FRACTION",
        default_value = "1.0",
        help = "Largest fraction a workload may request"
    )]
    pub max_fraction: f64,

    #[arg(
        long,
        env = "GPU_ALLOWED_ISOLATION_TYPES",
        value_delimiter = ',',
        default_value = "shared,process,partition,time-slice",
        help = "Comma separated isolation types workloads may request"
    )]
    pub allowed_isolation_types: Vec<IsolationType>,

    #[arg(
        long,
        env = "GPU_RESERVATION_CONFLICT_POLICY",
        default_value = "strict",
        help = "Reservation conflict policy, one of 'strict', 'flexible' or 'overlap'"
    )]
    pub conflict_policy: ConflictPolicy,

    #[arg(
        long,
        env = "GPU_MAX_RESERVATION_HOURS",
        default_value = "24",
        help = "Longest reservation window in hours"
    )]
    pub max_reservation_hours: u32,

    #[arg(
        long,
        env = "GPU_MAX_RESERVATIONS_PER_USER",
        default_value = "10",
        help = "Pending and active reservations a user may hold"
    )]
    pub max_reservations_per_user: usize,

    #[arg(
        long,
        env = "GPU_MAX_RESERVATIONS_PER_GPU",
        default_value = "20",
        help = "Pending and active reservations a device may hold"
    )]
    pub max_reservations_per_gpu: usize,

    #[arg(
        long,
        env = "GPU_RESERVATION_SWEEP_INTERVAL_SECS",
        default_value = "60",
        help = "Reservation activation and expiry sweep interval in seconds"
    )]
    pub reservation_sweep_interval_secs: u64,

    #[arg(
        long,
        env = "GPU_ISOLATION_START_COMMAND",
        help = "Command starting the isolation server of a device, the device id is appended"
    )]
    pub isolation_start_command: Option<String>,

    #[arg(
        long,
        env = "GPU_ISOLATION_STOP_COMMAND",
        help = "Command stopping the isolation server of a device, the device id is appended"
    )]
    pub isolation_stop_command: Option<String>,

    #[arg(
        long,
        env = "GPU_ISOLATION_HEALTH_COMMAND",
        help = "Command checking the isolation server of a device, exit status 0 means healthy"
    )]
    pub isolation_health_command: Option<String>,

    #[arg(
        long,
        env = "GPU_ISOLATION_TIMEOUT_MS",
        default_value = "10000",
        help = "Timeout of one isolation command in milliseconds"
    )]
    pub isolation_timeout_ms: u64,

    #[arg(
        long,
        env = "GPU_ISOLATION_HEALTH_INTERVAL_SECS",
        default_value = "30",
        help = "Isolation health check interval in seconds"
    )]
    pub isolation_health_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        daemon: DaemonArgs,
    }

    #[test]
    fn defaults() {
        let args = Harness::parse_from(["gpu-allocator"]).daemon;
        assert_eq!(args.discovery.discovery_source, DiscoverySource::Auto);
        assert_eq!(args.unpartitioned_mode, UnpartitionedMode::Fractional);
        assert_eq!(args.conflict_policy, ConflictPolicy::Strict);
        assert_eq!(args.allowed_isolation_types, IsolationType::ALL.to_vec());
        assert_eq!(args.time_slice_ms, 100);
        assert_eq!(args.default_memory_mib, DEFAULT_DEVICE_MEMORY_MIB);
        assert!(args.sharing_enabled);
        assert!(args.isolation_start_command.is_none());
    }

    #[test]
    fn explicit_flags() {
        let args = Harness::parse_from([
            "gpu-allocator",
            "--discovery-source",
            "inventory",
            "--inventory-path",
            "/etc/gpu/inventory.yaml",
            "--unpartitioned-mode",
            "time-sliced",
            "--conflict-policy",
            "overlap",
            "--allowed-isolation-types",
            "shared,process",
            "--sharing-enabled",
            "false",
        ])
        .daemon;
        assert_eq!(args.discovery.discovery_source, DiscoverySource::Inventory);
        assert_eq!(
            args.discovery.inventory_path,
            Some(PathBuf::from("/etc/gpu/inventory.yaml"))
        );
        assert_eq!(args.unpartitioned_mode, UnpartitionedMode::TimeSliced);
        assert_eq!(args.conflict_policy, ConflictPolicy::Overlap);
        assert_eq!(
            args.allowed_isolation_types,
            vec![IsolationType::Shared, IsolationType::Process]
        );
        assert!(!args.sharing_enabled);
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(Harness::try_parse_from(["gpu-allocator", "--conflict-policy", "loose"]).is_err());
    }
}
