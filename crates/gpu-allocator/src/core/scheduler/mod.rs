use std::time::Duration;

pub mod time_slice;

pub use time_slice::{Rotation, SchedulerSnapshot, TimeSlicingScheduler};

/// Default duration a workload keeps its turn on a time-sliced device.
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(100);

/// Memory assumed for a device the registry reports no capacity for.
pub const DEFAULT_DEVICE_MEMORY_MIB: u64 = 16 * 1024;

/// Configuration of the time-slicing scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub time_slice: Duration,
    /// Fallback capacity for devices registered without a memory total.
    pub default_memory_mib: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            time_slice: DEFAULT_TIME_SLICE,
            default_memory_mib: DEFAULT_DEVICE_MEMORY_MIB,
        }
    }
}
