//! Allocation under hardware compute partitioning.
//!
//! The valid fractions depend on the device's compute mode:
//!
//! | mode | valid fractions      | placement                    |
//! |------|----------------------|------------------------------|
//! | SPX  | 1.0                  | whole device, exclusive      |
//! | CPX  | k/8 for k in 1..=8   | `ceil(f * 8)` XCDs, lowest first |
//! | TPX  | 1/3, 2/3, 1.0        | fractional pool              |

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use api_types::AllocationStatus;
use chrono::{DateTime, Utc};
use error_stack::report;

use super::pool::SharePool;
use super::{AllocatorKind, DeviceSelection, GpuAllocator, Selector, XcdSlotMap};
use crate::core::error::{AllocationError, Result};
use crate::core::lock;
use crate::core::policy::AllocationPolicy;
use crate::core::types::{
    AllocationRequest, ComputeMode, DeviceCapacity, DeviceUsage, GpuAllocation, PartitionConfig,
    Share, XCD_COUNT,
};

/// Maximum distance between a requested fraction and a valid one.
pub const FRACTION_TOLERANCE: f64 = 0.001;

/// Fractions that can be granted under `mode`, ascending.
pub fn valid_fractions(mode: ComputeMode) -> Vec<f64> {
    match mode {
        ComputeMode::Spx => vec![1.0],
        ComputeMode::Cpx => (1..=XCD_COUNT)
            .map(|k| f64::from(k) / f64::from(XCD_COUNT))
            .collect(),
        ComputeMode::Tpx => vec![1.0 / 3.0, 2.0 / 3.0, 1.0],
    }
}

/// Matches `fraction` to a valid fraction of `mode`.
///
/// The matched canonical value is returned, so `0.1249` under CPX yields
/// exactly one eighth.
pub fn validate_fraction(mode: ComputeMode, fraction: f64) -> Result<Share> {
    let valid = valid_fractions(mode);
    valid
        .iter()
        .find(|candidate| (fraction - **candidate).abs() <= FRACTION_TOLERANCE)
        .map(|candidate| Share::nearest(*candidate))
        .ok_or_else(|| {
            let listed = valid
                .iter()
                .map(|f| format!("{f:.3}"))
                .collect::<Vec<_>>()
                .join(", ");
            report!(AllocationError::validation(format!(
                "fraction {fraction} is not valid in {mode} mode, expected one of [{listed}]"
            )))
        })
}

pub fn validate_partition_config(config: &PartitionConfig) -> Result<()> {
    config.validate()
}

#[derive(Debug)]
struct PartitionedDevice {
    config: PartitionConfig,
    pool: SharePool,
    xcds: XcdSlotMap,
}

impl PartitionedDevice {
    fn new(config: PartitionConfig, memory_total_mib: u64) -> Self {
        Self {
            config,
            pool: SharePool::new(memory_total_mib),
            xcds: XcdSlotMap::new(),
        }
    }

    fn check(&self, device_id: &str, share: Share, memory_mib: u64) -> Result<()> {
        match self.config.compute_mode {
            ComputeMode::Spx => {
                if let Some(holder) = self.pool.allocations().first() {
                    return Err(report!(AllocationError::exhausted(
                        device_id,
                        format!("device is exclusively held by {}", holder.id)
                    )));
                }
                self.pool.check_memory(device_id, memory_mib)
            }
            ComputeMode::Cpx => {
                let required = share.xcds();
                let free = self.xcds.free_count();
                if required > free {
                    return Err(report!(AllocationError::exhausted(
                        device_id,
                        format!("need {required} XCDs, {free} free")
                    )));
                }
                self.pool.check_memory(device_id, memory_mib)
            }
            ComputeMode::Tpx => self.pool.check(device_id, share, memory_mib),
        }
    }

    fn remove(&mut self, allocation_id: &str) -> Option<GpuAllocation> {
        let allocation = self.pool.remove(allocation_id)?;
        let freed = self.xcds.release(allocation_id);
        if !freed.is_empty() {
            tracing::debug!(allocation_id, xcds = ?freed, "freed XCDs");
        }
        Some(allocation)
    }

    fn usage(&self, device_id: &str) -> DeviceUsage {
        let mut usage = self.pool.usage(device_id);
        if self.config.compute_mode == ComputeMode::Cpx {
            usage.free_xcds = Some(self.xcds.free_count());
        }
        usage
    }
}

#[derive(Debug, Default)]
struct PartitionState {
    devices: BTreeMap<String, PartitionedDevice>,
    /// allocation id -> device id
    owners: HashMap<String, String>,
}

impl PartitionState {
    fn device(&self, device_id: &str) -> Result<&PartitionedDevice> {
        self.devices
            .get(device_id)
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))
    }

    fn check(
        &self,
        policy: &AllocationPolicy,
        device_id: &str,
        request: &AllocationRequest,
    ) -> Result<Share> {
        policy.admit(request)?;
        if self.owners.contains_key(&request.id) {
            return Err(report!(AllocationError::validation(format!(
                "allocation id `{}` is already in use",
                request.id
            ))));
        }
        let device = self.device(device_id)?;
        let share = validate_fraction(device.config.compute_mode, request.fraction)?;
        device.check(device_id, share, request.memory_mib)?;
        Ok(share)
    }
}

/// Allocator enforcing chiplet-level constraints on partitioned devices.
///
/// Each XCD index of a CPX device belongs to at most one allocation, and an
/// allocation holds exactly `ceil(fraction * 8)` of them.
#[derive(Debug, Default)]
pub struct PartitionAwareAllocator {
    policy: AllocationPolicy,
    state: RwLock<PartitionState>,
    selector: Selector,
}

impl PartitionAwareAllocator {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self {
            policy,
            state: RwLock::default(),
            selector: Selector::new(),
        }
    }

    /// Adds a device or reconciles a known one with fresh discovery data.
    ///
    /// # Errors
    ///
    /// - the configuration fails [`validate_partition_config`]
    /// - [`AllocationError::PolicyViolation`] when the partition mode changes
    ///   while allocations are live on the device
    pub fn register_device(&self, capacity: DeviceCapacity, config: PartitionConfig) -> Result<()> {
        validate_partition_config(&config)?;
        let mut state = lock::write(&self.state);
        let state = &mut *state;

        match state.devices.get_mut(&capacity.device_id) {
            Some(device) => {
                if device.config != config {
                    if !device.pool.is_empty() {
                        return Err(report!(AllocationError::policy(format!(
                            "cannot switch {} from {} to {config} with {} live allocations",
                            capacity.device_id,
                            device.config,
                            device.pool.len()
                        ))));
                    }
                    tracing::info!(
                        device_id = %capacity.device_id,
                        from = %device.config,
                        to = %config,
                        "partition mode changed"
                    );
                    device.config = config;
                    device.xcds = XcdSlotMap::new();
                }
                device
                    .pool
                    .set_memory_total_mib(capacity.memory_total_mib);
            }
            None => {
                tracing::info!(
                    device_id = %capacity.device_id,
                    partition = %config,
                    memory_mib = capacity.memory_total_mib,
                    "registered partitioned device"
                );
                state.devices.insert(
                    capacity.device_id,
                    PartitionedDevice::new(config, capacity.memory_total_mib),
                );
            }
        }
        Ok(())
    }

    pub fn partition_config(&self, device_id: &str) -> Option<PartitionConfig> {
        lock::read(&self.state)
            .devices
            .get(device_id)
            .map(|device| device.config)
    }

    /// XCD indices held by an allocation, empty outside CPX mode.
    pub fn xcds_of(&self, allocation_id: &str) -> Vec<u8> {
        let state = lock::read(&self.state);
        state
            .owners
            .get(allocation_id)
            .and_then(|device_id| state.devices.get(device_id))
            .map(|device| device.xcds.owned_by(allocation_id))
            .unwrap_or_default()
    }
}

impl GpuAllocator for PartitionAwareAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::PartitionAware
    }

    fn device_ids(&self) -> Vec<String> {
        lock::read(&self.state).devices.keys().cloned().collect()
    }

    fn can_allocate(&self, device_id: &str, request: &AllocationRequest) -> Result<()> {
        lock::read(&self.state)
            .check(&self.policy, device_id, request)
            .map(|_| ())
    }

    #[tracing::instrument(skip(self, request), fields(allocation_id = %request.id, fraction = request.fraction))]
    fn allocate(&self, device_id: &str, request: AllocationRequest) -> Result<GpuAllocation> {
        let mut state = lock::write(&self.state);
        let share = state.check(&self.policy, device_id, &request)?;
        let state = &mut *state;
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))?;

        let mut allocation =
            GpuAllocation::from_request(device_id, request, share, AllocationStatus::Active);
        if device.config.compute_mode == ComputeMode::Cpx {
            allocation.xcd_indices = device
                .xcds
                .claim(&allocation.id, share.xcds())
                .ok_or_else(|| {
                    report!(AllocationError::exhausted(device_id, "XCDs were claimed concurrently"))
                })?;
        }
        device.pool.push(allocation.clone());
        state
            .owners
            .insert(allocation.id.clone(), device_id.to_string());

        tracing::info!(
            mode = %device.config.compute_mode,
            xcds = ?allocation.xcd_indices,
            memory_mib = allocation.memory_mib,
            "granted partitioned allocation"
        );
        Ok(allocation)
    }

    #[tracing::instrument(skip(self))]
    fn release(&self, allocation_id: &str) -> Result<GpuAllocation> {
        let mut state = lock::write(&self.state);
        let device_id = state
            .owners
            .remove(allocation_id)
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))?;
        let mut allocation = state
            .devices
            .get_mut(&device_id)
            .and_then(|device| device.remove(allocation_id))
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))?;
        allocation.status = AllocationStatus::Completed;
        tracing::info!(device_id = %device_id, "released partitioned allocation");
        Ok(allocation)
    }

    fn get_allocation(&self, allocation_id: &str) -> Result<GpuAllocation> {
        let state = lock::read(&self.state);
        state
            .owners
            .get(allocation_id)
            .and_then(|device_id| state.devices.get(device_id))
            .and_then(|device| device.pool.get(allocation_id))
            .cloned()
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))
    }

    fn list_allocations(&self, device_id: &str) -> Result<Vec<GpuAllocation>> {
        Ok(lock::read(&self.state)
            .device(device_id)?
            .pool
            .allocations()
            .to_vec())
    }

    fn device_usage(&self, device_id: &str) -> Result<DeviceUsage> {
        Ok(lock::read(&self.state).device(device_id)?.usage(device_id))
    }

    fn active_allocation_count(&self, device_id: &str) -> usize {
        lock::read(&self.state)
            .devices
            .get(device_id)
            .map_or(0, |device| device.pool.len())
    }

    fn cleanup_expired_allocations_at(&self, now: DateTime<Utc>) -> Vec<GpuAllocation> {
        let mut state = lock::write(&self.state);
        let state = &mut *state;
        let mut expired = Vec::new();
        for device in state.devices.values_mut() {
            for allocation in device.pool.drain_expired(now) {
                device.xcds.release(&allocation.id);
                expired.push(allocation);
            }
        }
        for allocation in &mut expired {
            state.owners.remove(&allocation.id);
            allocation.status = AllocationStatus::Expired;
            tracing::info!(
                allocation_id = %allocation.id,
                device_id = %allocation.device_id,
                xcds = ?allocation.xcd_indices,
                "partitioned allocation expired"
            );
        }
        expired
    }
}

impl DeviceSelection for PartitionAwareAllocator {
    fn selector(&self) -> &Selector {
        &self.selector
    }
}
