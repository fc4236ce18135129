pub mod cli;
pub mod daemon;
pub mod inventory;

use std::time::Duration;

use chrono::TimeDelta;

use crate::core::policy::AllocationPolicy;
use crate::core::reservation::ReservationConfig;
use crate::core::scheduler::SchedulerConfig;
use crate::platform::isolation::IsolationConfig;
use crate::platform::registry::RegistryConfig;

impl From<&daemon::DaemonArgs> for RegistryConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            temperature_limit_celsius: args.temperature_limit,
            max_allocations_per_device: args.max_allocations_per_device.max(1),
            poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
        }
    }
}

impl From<&daemon::DaemonArgs> for AllocationPolicy {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            sharing_enabled: args.sharing_enabled,
            min_fraction: args.min_fraction,
            max_fraction: args.max_fraction,
            allowed_isolation_types: args.allowed_isolation_types.clone(),
        }
    }
}

impl From<&daemon::DaemonArgs> for SchedulerConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            time_slice: Duration::from_millis(args.time_slice_ms.max(1)),
            default_memory_mib: args.default_memory_mib,
        }
    }
}

impl From<&daemon::DaemonArgs> for ReservationConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            conflict_policy: args.conflict_policy,
            max_reservation_duration: TimeDelta::hours(i64::from(args.max_reservation_hours)),
            max_reservations_per_user: args.max_reservations_per_user,
            max_reservations_per_gpu: args.max_reservations_per_gpu,
            sweep_interval: Duration::from_secs(args.reservation_sweep_interval_secs.max(1)),
        }
    }
}

impl From<&daemon::DaemonArgs> for IsolationConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            start_command: args.isolation_start_command.clone(),
            stop_command: args.isolation_stop_command.clone(),
            health_command: args.isolation_health_command.clone(),
            timeout: Duration::from_millis(args.isolation_timeout_ms),
            health_interval: Duration::from_secs(args.isolation_health_interval_secs.max(1)),
        }
    }
}

pub use cli::*;
pub use daemon::*;
pub use inventory::*;
