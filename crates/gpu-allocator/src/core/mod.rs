//! Allocation and scheduling core. Nothing here performs I/O.

pub mod allocator;
pub mod error;
pub(crate) mod lock;
pub mod policy;
pub mod reservation;
pub mod scheduler;
pub mod types;

pub use allocator::{
    AllocatorKind, DeviceSelection, FractionalAllocator, GpuAllocator, PartitionAwareAllocator,
    SelectionStrategy,
};
pub use error::{AllocationError, ResourceKind, Result};
pub use policy::AllocationPolicy;
pub use reservation::{ConflictPolicy, ReservationConfig, ReservationManager};
pub use scheduler::{SchedulerConfig, TimeSlicingScheduler};
pub use types::{
    AllocationRequest, ComputeMode, DeviceCapacity, DeviceUsage, GpuAllocation, MemoryMode,
    PartitionConfig, Share,
};
