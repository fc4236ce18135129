//! Capacity-only allocation without hardware partition awareness.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use api_types::AllocationStatus;
use chrono::{DateTime, Utc};
use error_stack::report;

use super::pool::SharePool;
use super::{AllocatorKind, DeviceSelection, GpuAllocator, Selector};
use crate::core::error::{AllocationError, Result};
use crate::core::lock;
use crate::core::policy::AllocationPolicy;
use crate::core::types::{AllocationRequest, DeviceCapacity, DeviceUsage, GpuAllocation, Share};

#[derive(Debug, Default)]
struct FractionalState {
    devices: BTreeMap<String, SharePool>,
    /// allocation id -> device id
    owners: HashMap<String, String>,
}

impl FractionalState {
    fn pool(&self, device_id: &str) -> Result<&SharePool> {
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
        let share = policy.admit(request)?;
        if self.owners.contains_key(&request.id) {
            return Err(report!(AllocationError::validation(format!(
                "allocation id `{}` is already in use",
                request.id
            ))));
        }
        self.pool(device_id)?
            .check(device_id, share, request.memory_mib)?;
        Ok(share)
    }
}

/// Grants any fraction that fits into what is left of a device.
///
/// The sum of live fractions on a device never exceeds 1.0 and the sum of
/// their memory never exceeds the device total.
#[derive(Debug, Default)]
pub struct FractionalAllocator {
    policy: AllocationPolicy,
    state: RwLock<FractionalState>,
    selector: Selector,
}

impl FractionalAllocator {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self {
            policy,
            state: RwLock::default(),
            selector: Selector::new(),
        }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Adds a device or updates the memory total of a known one.
    ///
    /// Existing allocations are kept.
    pub fn register_device(&self, capacity: DeviceCapacity) {
        let mut state = lock::write(&self.state);
        match state.devices.get_mut(&capacity.device_id) {
            Some(pool) => {
                if pool.memory_total_mib() != capacity.memory_total_mib {
                    tracing::info!(
                        device_id = %capacity.device_id,
                        old_mib = pool.memory_total_mib(),
                        new_mib = capacity.memory_total_mib,
                        "device memory total changed"
                    );
                    if pool.memory_used_mib() > capacity.memory_total_mib {
                        tracing::warn!(
                            device_id = %capacity.device_id,
                            used_mib = pool.memory_used_mib(),
                            "live allocations exceed the new memory total"
                        );
                    }
                    pool.set_memory_total_mib(capacity.memory_total_mib);
                }
            }
            None => {
                tracing::debug!(device_id = %capacity.device_id, "registered fractional device");
                state.devices.insert(
                    capacity.device_id,
                    SharePool::new(capacity.memory_total_mib),
                );
            }
        }
    }
}

impl GpuAllocator for FractionalAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Fractional
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

        let allocation =
            GpuAllocation::from_request(device_id, request, share, AllocationStatus::Active);
        state
            .owners
            .insert(allocation.id.clone(), device_id.to_string());
        if let Some(pool) = state.devices.get_mut(device_id) {
            pool.push(allocation.clone());
        }
        tracing::info!(
            memory_mib = allocation.memory_mib,
            "granted fractional allocation"
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
            .and_then(|pool| pool.remove(allocation_id))
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))?;
        allocation.status = AllocationStatus::Completed;
        tracing::info!(device_id = %device_id, "released fractional allocation");
        Ok(allocation)
    }

    fn get_allocation(&self, allocation_id: &str) -> Result<GpuAllocation> {
        let state = lock::read(&self.state);
        state
            .owners
            .get(allocation_id)
            .and_then(|device_id| state.devices.get(device_id))
            .and_then(|pool| pool.get(allocation_id))
            .cloned()
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))
    }

    fn list_allocations(&self, device_id: &str) -> Result<Vec<GpuAllocation>> {
        Ok(lock::read(&self.state).pool(device_id)?.allocations().to_vec())
    }

    fn device_usage(&self, device_id: &str) -> Result<DeviceUsage> {
        Ok(lock::read(&self.state).pool(device_id)?.usage(device_id))
    }

    fn active_allocation_count(&self, device_id: &str) -> usize {
        lock::read(&self.state)
            .devices
            .get(device_id)
            .map_or(0, SharePool::len)
    }

    fn cleanup_expired_allocations_at(&self, now: DateTime<Utc>) -> Vec<GpuAllocation> {
        let mut state = lock::write(&self.state);
        let mut expired = Vec::new();
        for pool in state.devices.values_mut() {
            expired.extend(pool.drain_expired(now));
        }
        for allocation in &mut expired {
            state.owners.remove(&allocation.id);
            allocation.status = AllocationStatus::Expired;
            tracing::info!(
                allocation_id = %allocation.id,
                device_id = %allocation.device_id,
                "fractional allocation expired"
            );
        }
        expired
    }
}

impl DeviceSelection for FractionalAllocator {
    fn selector(&self) -> &Selector {
        &self.selector
    }
}

#[cfg(test)]
mod tests {
    use api_types::{GpuRequest, IsolationType, WorkloadRef};
    use chrono::TimeDelta;
    use test_log::test;

    use super::*;
    use crate::core::allocator::SelectionStrategy;

    fn request(id: &str, fraction: f64, memory_mib: u64) -> AllocationRequest {
        AllocationRequest::new(
            id,
            WorkloadRef::new("default", id, "main"),
            &GpuRequest {
                fraction,
                memory_mib,
                sharing_enabled: true,
                isolation_type: IsolationType::Shared,
            },
        )
    }

    fn allocator(devices: &[(&str, u64)]) -> FractionalAllocator {
        let allocator = FractionalAllocator::default();
        for (device_id, memory) in devices {
            allocator.register_device(DeviceCapacity::new(*device_id, *memory));
        }
        allocator
    }

    fn error_of<T: std::fmt::Debug>(result: Result<T>) -> AllocationError {
        result.unwrap_err().current_context().clone()
    }

    #[test]
    fn fractions_never_exceed_whole_device() {
        let allocator = allocator(&[("card0", 16384)]);
        allocator.allocate("card0", request("a", 0.5, 1024)).unwrap();
        allocator.allocate("card0", request("b", 0.3, 1024)).unwrap();

        let err = error_of(allocator.allocate("card0", request("c", 0.3, 1024)));
        assert!(err.is_transient(), "{err}");
        allocator.allocate("card0", request("c", 0.2, 1024)).unwrap();

        let usage = allocator.device_usage("card0").unwrap();
        assert_eq!(usage.share_used, Share::WHOLE);
        assert_eq!(usage.active_allocations, 3);
    }

    #[test]
    fn memory_is_checked_independently_of_fraction() {
        let allocator = allocator(&[("card0", 8192)]);
        allocator.allocate("card0", request("a", 0.1, 6000)).unwrap();
        let err = error_of(allocator.allocate("card0", request("b", 0.1, 3000)));
        assert!(matches!(err, AllocationError::ResourceExhausted { .. }));
    }

    #[test]
    fn release_restores_capacity() {
        let allocator = allocator(&[("card0", 8192)]);
        let before = allocator.device_usage("card0").unwrap();

        allocator.allocate("card0", request("a", 0.4, 2048)).unwrap();
        let released = allocator.release("a").unwrap();
        assert_eq!(released.status, AllocationStatus::Completed);
        assert_eq!(allocator.device_usage("card0").unwrap(), before);

        assert!(error_of(allocator.release("a")).is_not_found());
        assert!(error_of(allocator.get_allocation("a")).is_not_found());
    }

    #[test]
    fn duplicate_ids_and_unknown_devices_are_rejected() {
        let allocator = allocator(&[("card0", 8192)]);
        allocator.allocate("card0", request("a", 0.2, 0)).unwrap();
        assert!(matches!(
            error_of(allocator.allocate("card0", request("a", 0.2, 0))),
            AllocationError::Validation { .. }
        ));
        assert!(error_of(allocator.allocate("card7", request("b", 0.2, 0))).is_not_found());
        assert_eq!(allocator.active_allocation_count("card7"), 0);
    }

    #[test]
    fn cleanup_drops_only_expired_allocations() {
        let allocator = allocator(&[("card0", 8192)]);
        let now = Utc::now();
        allocator
            .allocate(
                "card0",
                request("short", 0.5, 1024).with_expiry(now + TimeDelta::seconds(5)),
            )
            .unwrap();
        allocator.allocate("card0", request("long", 0.5, 1024)).unwrap();

        assert!(allocator.cleanup_expired_allocations_at(now).is_empty());
        let expired = allocator.cleanup_expired_allocations_at(now + TimeDelta::seconds(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, AllocationStatus::Expired);
        assert_eq!(allocator.active_allocation_count("card0"), 1);
        assert!(allocator.release("short").is_err());
    }

    #[test]
    fn register_device_keeps_allocations() {
        let allocator = allocator(&[("card0", 8192)]);
        allocator.allocate("card0", request("a", 0.5, 4096)).unwrap();
        allocator.register_device(DeviceCapacity::new("card0", 16384));

        let usage = allocator.device_usage("card0").unwrap();
        assert_eq!(usage.memory_total_mib, 16384);
        assert_eq!(usage.memory_used_mib, 4096);
    }

    #[test]
    fn selection_only_considers_capable_devices() {
        let allocator = allocator(&[("card0", 8192), ("card1", 8192), ("card2", 1024)]);
        allocator.allocate("card0", request("a", 0.9, 0)).unwrap();
        allocator.allocate("card1", request("b", 0.3, 0)).unwrap();

        let wanted = request("c", 0.5, 2048);
        // card0 lacks fraction, card2 lacks memory
        assert_eq!(allocator.find_best_fit_gpu(&wanted).unwrap(), "card1");
        assert_eq!(allocator.find_load_balanced_gpu(&wanted).unwrap(), "card1");

        let too_big = request("d", 1.0, 0);
        assert_eq!(
            allocator
                .select_gpu(SelectionStrategy::FirstFit, &too_big)
                .unwrap(),
            "card2"
        );
        allocator.allocate("card2", request("e", 0.1, 0)).unwrap();
        assert!(allocator
            .select_gpu(SelectionStrategy::FirstFit, &too_big)
            .unwrap_err()
            .current_context()
            .is_transient());
    }
}
