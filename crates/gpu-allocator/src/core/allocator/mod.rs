use std::fmt;

use chrono::{DateTime, Utc};
use error_stack::report;

use super::error::{AllocationError, Result};
use super::types::{AllocationRequest, DeviceUsage, GpuAllocation};

pub mod fractional;
pub mod partition;
pub(crate) mod pool;
pub mod selection;
pub mod xcd;

pub use fractional::FractionalAllocator;
pub use partition::{
    valid_fractions, validate_fraction, validate_partition_config, PartitionAwareAllocator,
};
pub use selection::{SelectionStrategy, Selector};
pub use xcd::XcdSlotMap;

/// Which allocation component owns an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    Fractional,
    PartitionAware,
    TimeSlicing,
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocatorKind::Fractional => "fractional",
            AllocatorKind::PartitionAware => "partition-aware",
            AllocatorKind::TimeSlicing => "time-slicing",
        })
    }
}

/// Allocation contract shared by every allocation component.
///
/// Implementations guard all of their state behind a single lock. Reads take
/// it shared, mutations take it exclusive, and no method performs I/O.
pub trait GpuAllocator: Send + Sync {
    fn kind(&self) -> AllocatorKind;

    /// Device ids known to this allocator, sorted.
    fn device_ids(&self) -> Vec<String>;

    /// Check whether `request` would fit on `device_id` right now
    fn can_allocate(&self, device_id: &str, request: &AllocationRequest) -> Result<()>;

    /// Grant `request` on `device_id`
    ///
    /// The capacity check and the insert happen under the same exclusive lock.
    fn allocate(&self, device_id: &str, request: AllocationRequest) -> Result<GpuAllocation>;

    /// Release an allocation, returning it with status `completed`
    fn release(&self, allocation_id: &str) -> Result<GpuAllocation>;

    fn get_allocation(&self, allocation_id: &str) -> Result<GpuAllocation>;

    /// Live allocations on one device
    fn list_allocations(&self, device_id: &str) -> Result<Vec<GpuAllocation>>;

    fn device_usage(&self, device_id: &str) -> Result<DeviceUsage>;

    /// Number of live allocations, zero for unknown devices
    fn active_allocation_count(&self, device_id: &str) -> usize;

    /// Drop every allocation whose expiry is at or before `now`.
    ///
    /// The dropped allocations are returned with status `expired`.
    fn cleanup_expired_allocations_at(&self, now: DateTime<Utc>) -> Vec<GpuAllocation>;

    fn cleanup_expired_allocations(&self) -> Vec<GpuAllocation> {
        self.cleanup_expired_allocations_at(Utc::now())
    }

    fn contains_device(&self, device_id: &str) -> bool {
        self.device_usage(device_id).is_ok()
    }
}

/// Device selection on top of [`GpuAllocator`].
///
/// Selection is advisory: the chosen device is re-checked by `allocate`, so a
/// concurrent request may still win the race for it.
pub trait DeviceSelection: GpuAllocator {
    fn selector(&self) -> &Selector;

    /// Pick a device for `request` according to `strategy`.
    ///
    /// # Errors
    ///
    /// [`AllocationError::ResourceExhausted`] when no device can take the
    /// request.
    fn select_gpu(
        &self,
        strategy: SelectionStrategy,
        request: &AllocationRequest,
    ) -> Result<String> {
        let candidates = self
            .device_ids()
            .into_iter()
            .filter(|device_id| self.can_allocate(device_id, request).is_ok())
            .filter_map(|device_id| self.device_usage(&device_id).ok())
            .collect::<Vec<_>>();

        self.selector()
            .pick(strategy, candidates)
            .map(|usage| usage.device_id)
            .ok_or_else(|| {
                report!(AllocationError::exhausted(
                    "*",
                    format!(
                        "no device can take fraction {} with {} MiB",
                        request.fraction, request.memory_mib
                    )
                ))
            })
    }

    fn find_best_fit_gpu(&self, request: &AllocationRequest) -> Result<String> {
        self.select_gpu(SelectionStrategy::BestFit, request)
    }

    fn find_load_balanced_gpu(&self, request: &AllocationRequest) -> Result<String> {
        self.select_gpu(SelectionStrategy::LoadBalanced, request)
    }
}
