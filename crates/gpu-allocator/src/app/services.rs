use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use api_types::IsolationType;
use error_stack::{report, ResultExt};

use crate::config::UnpartitionedMode;
use crate::core::allocator::{
    AllocatorKind, FractionalAllocator, GpuAllocator, PartitionAwareAllocator, SelectionStrategy,
    Selector,
};
use crate::core::error::{AllocationError, Result};
use crate::core::lock;
use crate::core::policy::AllocationPolicy;
use crate::core::reservation::{Reservation, ReservationManager, ReservationRequest};
use crate::core::scheduler::{Rotation, SchedulerConfig, TimeSlicingScheduler};
use crate::core::types::{AllocationRequest, DeviceCapacity, GpuAllocation};
use crate::platform::discovery::DiscoveryResult;
use crate::platform::isolation::IsolationSessions;
use crate::platform::registry::{DeviceRegistry, RefreshSummary};

/// Application dependencies shared by the background tasks
pub struct ApplicationServices {
    pub registry: Arc<DeviceRegistry>,
    pub allocations: Arc<AllocationService>,
    pub reservations: Arc<ReservationManager>,
    pub isolation: Option<Arc<IsolationSessions>>,
}

/// Single entry point for allocation requests of this node.
///
/// Routes every request to the allocator matching its device: partitioned
/// devices go to the partition-aware allocator, unpartitioned devices to the
/// fractional allocator or, for time-slice isolation or a time-sliced node,
/// to the time-slicing scheduler.
///
/// An unpartitioned device is booked by one allocator at a time: while it
/// holds fractional allocations it refuses time-sliced ones and the other
/// way round.
///
/// Lock order is owner index, then allocator. Neither is held across an
/// isolation backend call.
pub struct AllocationService {
    registry: Arc<DeviceRegistry>,
    fractional: FractionalAllocator,
    partitioned: PartitionAwareAllocator,
    scheduler: TimeSlicingScheduler,
    reservations: Arc<ReservationManager>,
    isolation: Option<Arc<IsolationSessions>>,
    unpartitioned_mode: UnpartitionedMode,
    owners: RwLock<HashMap<String, AllocatorKind>>,
    selector: Selector,
}

impl AllocationService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        policy: AllocationPolicy,
        scheduler_config: SchedulerConfig,
        reservations: Arc<ReservationManager>,
        unpartitioned_mode: UnpartitionedMode,
    ) -> Self {
        Self {
            registry,
            fractional: FractionalAllocator::new(policy.clone()),
            partitioned: PartitionAwareAllocator::new(policy.clone()),
            scheduler: TimeSlicingScheduler::new(scheduler_config, policy),
            reservations,
            isolation: None,
            unpartitioned_mode,
            owners: RwLock::default(),
            selector: Selector::new(),
        }
    }

    pub fn with_isolation(mut self, isolation: Arc<IsolationSessions>) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn fractional(&self) -> &FractionalAllocator {
        &self.fractional
    }

    pub fn partition_aware(&self) -> &PartitionAwareAllocator {
        &self.partitioned
    }

    pub fn scheduler(&self) -> &TimeSlicingScheduler {
        &self.scheduler
    }

    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    pub fn allocator(&self, kind: AllocatorKind) -> &dyn GpuAllocator {
        match kind {
            AllocatorKind::Fractional => &self.fractional,
            AllocatorKind::PartitionAware => &self.partitioned,
            AllocatorKind::TimeSlicing => &self.scheduler,
        }
    }

    fn allocators(&self) -> [&dyn GpuAllocator; 3] {
        [&self.fractional, &self.partitioned, &self.scheduler]
    }

    /// Which allocator serves `request` on `device_id`.
    pub fn route(&self, device_id: &str, request: &AllocationRequest) -> Result<AllocatorKind> {
        let device = self.registry.get_device(device_id)?;
        let kind = if device.partition().is_some() {
            AllocatorKind::PartitionAware
        } else if request.isolation_type == IsolationType::TimeSlice
            || self.unpartitioned_mode == UnpartitionedMode::TimeSliced
        {
            AllocatorKind::TimeSlicing
        } else {
            AllocatorKind::Fractional
        };
        Ok(kind)
    }

    /// Push the registry's devices into the allocators.
    ///
    /// Returns the devices that could not be registered, a refused partition
    /// mode switch being the usual reason.
    pub fn sync_devices(&self) -> Vec<String> {
        let mut rejected = Vec::new();
        for device in self.registry.list_devices() {
            let capacity = DeviceCapacity::new(device.device_id(), device.memory_total_mib());
            match device.partition() {
                Some(config) => {
                    if let Err(e) = self.partitioned.register_device(capacity, config) {
                        tracing::warn!(
                            device_id = %device.device_id(),
                            "cannot register partitioned device: {:?}",
                            e
                        );
                        rejected.push(device.device_id().to_string());
                    }
                }
                None => {
                    self.fractional.register_device(capacity.clone());
                    self.scheduler.register_device(capacity);
                }
            }
            self.sync_allocation_count(device.device_id());
        }
        rejected
    }

    /// Refresh discovery and reconcile the allocators with the result.
    pub async fn refresh_devices(&self) -> DiscoveryResult<RefreshSummary> {
        let summary = self.registry.refresh_all().await?;
        self.sync_devices();
        Ok(summary)
    }

    fn sync_allocation_count(&self, device_id: &str) {
        let count = self
            .allocators()
            .iter()
            .map(|allocator| allocator.active_allocation_count(device_id))
            .sum();
        if let Err(e) = self.registry.set_active_allocations(device_id, count) {
            tracing::debug!(device_id, "allocation count not recorded: {:?}", e);
        }
    }

    fn ensure_available(&self, device_id: &str) -> Result<()> {
        let device = self.registry.get_device(device_id)?;
        if device.is_available {
            return Ok(());
        }
        Err(report!(AllocationError::exhausted(
            device_id,
            "device is unavailable"
        )))
        .attach_printable_lazy(|| {
            format!(
                "temperature: {:?}, active allocations: {}, missing: {}",
                device.descriptor.temperature_celsius, device.active_allocations, device.missing
            )
        })
    }

    /// Fractional and time-sliced bookings never share a device.
    fn ensure_single_booking(&self, device_id: &str, kind: AllocatorKind) -> Result<()> {
        let other = match kind {
            AllocatorKind::Fractional => AllocatorKind::TimeSlicing,
            AllocatorKind::TimeSlicing => AllocatorKind::Fractional,
            AllocatorKind::PartitionAware => return Ok(()),
        };
        let held = self.allocator(other).active_allocation_count(device_id);
        if held == 0 {
            return Ok(());
        }
        Err(report!(AllocationError::policy(format!(
            "{device_id} is booked by the {other} allocator, {kind} requests must wait"
        ))))
        .attach_printable(format!("{held} live {other} allocations"))
    }

    /// Counted from the allocators, the registry's count may lag behind.
    fn ensure_below_ceiling(&self, device_id: &str) -> Result<()> {
        let ceiling = self.registry.config().max_allocations_per_device;
        let count: usize = self
            .allocators()
            .iter()
            .map(|allocator| allocator.active_allocation_count(device_id))
            .sum();
        if count < ceiling {
            return Ok(());
        }
        Err(report!(AllocationError::exhausted(
            device_id,
            format!("{count} allocations reach the per-device ceiling of {ceiling}")
        )))
    }

    pub fn can_allocate(&self, device_id: &str, request: &AllocationRequest) -> Result<()> {
        self.ensure_available(device_id)?;
        let kind = self.route(device_id, request)?;
        self.ensure_single_booking(device_id, kind)?;
        self.allocator(kind).can_allocate(device_id, request)
    }

    /// Grant `request` on `device_id`.
    ///
    /// A process-isolated allocation also holds the device's isolation
    /// session; if the session cannot be started the allocation is undone.
    #[tracing::instrument(skip(self, request), fields(allocation_id = %request.id, fraction = request.fraction))]
    pub async fn allocate(
        &self,
        device_id: &str,
        request: AllocationRequest,
    ) -> Result<GpuAllocation> {
        self.ensure_available(device_id)?;
        let kind = self.route(device_id, &request)?;

        let allocation = {
            let mut owners = lock::write(&self.owners);
            if owners.contains_key(&request.id) {
                return Err(report!(AllocationError::validation(format!(
                    "allocation id {} is already in use",
                    request.id
                ))));
            }
            self.ensure_single_booking(device_id, kind)?;
            self.ensure_below_ceiling(device_id)?;
            let allocation = self.allocator(kind).allocate(device_id, request)?;
            owners.insert(allocation.id.clone(), kind);
            allocation
        };
        self.sync_allocation_count(device_id);

        if let Err(e) = self.open_session(&allocation).await {
            self.forget(&allocation.id, kind);
            if let Err(undo) = self.allocator(kind).release(&allocation.id) {
                tracing::error!("failed to undo allocation {}: {:?}", allocation.id, undo);
            }
            self.sync_allocation_count(device_id);
            return Err(e);
        }

        tracing::info!(
            device_id,
            allocator = %kind,
            share = %allocation.share,
            memory_mib = allocation.memory_mib,
            xcds = ?allocation.xcd_indices,
            "allocation granted"
        );
        Ok(allocation)
    }

    /// Pick a device with `strategy` among the available ones, then allocate.
    pub async fn allocate_auto(
        &self,
        strategy: SelectionStrategy,
        request: AllocationRequest,
    ) -> Result<GpuAllocation> {
        let candidates = self
            .registry
            .list_devices()
            .into_iter()
            .filter(|device| device.is_available)
            .filter_map(|device| {
                self.can_allocate(device.device_id(), &request).ok()?;
                let kind = self.route(device.device_id(), &request).ok()?;
                self.allocator(kind).device_usage(device.device_id()).ok()
            })
            .collect::<Vec<_>>();

        let Some(usage) = self.selector.pick(strategy, candidates) else {
            return Err(report!(AllocationError::exhausted(
                "*",
                format!(
                    "no available device can take fraction {} with {} MiB",
                    request.fraction, request.memory_mib
                )
            )));
        };
        tracing::debug!(device_id = %usage.device_id, ?strategy, "selected device");
        self.allocate(&usage.device_id, request).await
    }

    /// Release an allocation wherever it lives.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, allocation_id: &str) -> Result<GpuAllocation> {
        let released = {
            let mut owners = lock::write(&self.owners);
            let kind = owners
                .get(allocation_id)
                .copied()
                .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))?;
            let released = self.allocator(kind).release(allocation_id)?;
            owners.remove(allocation_id);
            released
        };
        self.sync_allocation_count(&released.device_id);
        self.close_session(&released).await;

        tracing::info!(device_id = %released.device_id, "allocation released");
        Ok(released)
    }

    pub fn get_allocation(&self, allocation_id: &str) -> Result<GpuAllocation> {
        let kind = lock::read(&self.owners)
            .get(allocation_id)
            .copied()
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))?;
        self.allocator(kind).get_allocation(allocation_id)
    }

    /// Live allocations on `device_id` across all allocators.
    pub fn list_allocations(&self, device_id: &str) -> Vec<GpuAllocation> {
        self.allocators()
            .iter()
            .filter_map(|allocator| allocator.list_allocations(device_id).ok())
            .flatten()
            .collect()
    }

    /// Expire allocations whose TTL passed in every allocator.
    pub async fn cleanup_expired(&self) -> Vec<GpuAllocation> {
        let expired = {
            let mut owners = lock::write(&self.owners);
            let expired = self
                .allocators()
                .iter()
                .flat_map(|allocator| allocator.cleanup_expired_allocations())
                .collect::<Vec<_>>();
            for allocation in &expired {
                owners.remove(&allocation.id);
            }
            expired
        };

        let devices = expired
            .iter()
            .map(|allocation| allocation.device_id.as_str())
            .collect::<BTreeSet<_>>();
        for device_id in devices {
            self.sync_allocation_count(device_id);
        }
        for allocation in &expired {
            self.close_session(allocation).await;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired allocations dropped");
        }
        expired
    }

    /// Rotate every time-sliced device whose slice has elapsed.
    pub fn update_scheduling(&self) -> Vec<(String, Rotation)> {
        let rotations = self.scheduler.update_all();
        for (device_id, rotation) in &rotations {
            tracing::trace!(
                device_id = %device_id,
                previous = ?rotation.previous,
                current = ?rotation.current,
                "time slice rotated"
            );
        }
        rotations
    }

    /// Reserve a known device for a future window.
    pub fn create_reservation(&self, request: ReservationRequest) -> Result<Reservation> {
        self.registry.get_device(&request.gpu_id)?;
        self.reservations.create_reservation(request)
    }

    fn forget(&self, allocation_id: &str, kind: AllocatorKind) {
        let mut owners = lock::write(&self.owners);
        if owners.get(allocation_id) == Some(&kind) {
            owners.remove(allocation_id);
        }
    }

    async fn open_session(&self, allocation: &GpuAllocation) -> Result<()> {
        let Some(isolation) = self.isolation_for(allocation) else {
            return Ok(());
        };
        isolation
            .acquire(&allocation.device_id)
            .await
            .change_context(AllocationError::exhausted(
                &allocation.device_id,
                "isolation session could not be started",
            ))
    }

    async fn close_session(&self, allocation: &GpuAllocation) {
        let Some(isolation) = self.isolation_for(allocation) else {
            return;
        };
        if let Err(e) = isolation.release(&allocation.device_id).await {
            tracing::warn!(
                device_id = %allocation.device_id,
                "failed to stop isolation session: {:?}",
                e
            );
        }
    }

    fn isolation_for(&self, allocation: &GpuAllocation) -> Option<&IsolationSessions> {
        if allocation.isolation_type != IsolationType::Process {
            return None;
        }
        self.isolation.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use api_types::{AllocationStatus, GpuRequest, WorkloadRef};
    use chrono::{TimeDelta, Utc};
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::core::reservation::ReservationConfig;
    use crate::core::types::{mib_to_bytes, ComputeMode, MemoryMode, PartitionConfig};
    use crate::platform::discovery::testing::StaticBackend;
    use crate::platform::discovery::DeviceDescriptor;
    use crate::platform::isolation::testing::RecordingBackend;
    use crate::platform::registry::RegistryConfig;

    fn descriptor(device_id: &str, partition: Option<PartitionConfig>) -> DeviceDescriptor {
        let mut descriptor = DeviceDescriptor::new(device_id, "MI300X", mib_to_bytes(8192));
        descriptor.partition = partition;
        descriptor
    }

    async fn service(mode: UnpartitionedMode, registry_config: RegistryConfig) -> AllocationService {
        let backend = Arc::new(StaticBackend::with_devices(vec![
            descriptor(
                "card0",
                Some(PartitionConfig::new(ComputeMode::Cpx, MemoryMode::Nps4)),
            ),
            descriptor("card1", None),
        ]));
        let registry = Arc::new(DeviceRegistry::new(backend, registry_config));
        let service = AllocationService::new(
            registry,
            AllocationPolicy::default(),
            SchedulerConfig {
                time_slice: Duration::from_secs(60),
                ..Default::default()
            },
            Arc::new(ReservationManager::new(ReservationConfig::default())),
            mode,
        );
        service.refresh_devices().await.unwrap();
        service
    }

    fn request(id: &str, fraction: f64, isolation_type: IsolationType) -> AllocationRequest {
        AllocationRequest::new(
            id,
            WorkloadRef::new("default", id, "main"),
            &GpuRequest {
                fraction,
                memory_mib: 1024,
                sharing_enabled: true,
                isolation_type,
            },
        )
    }

    fn error_of<T: std::fmt::Debug>(result: Result<T>) -> AllocationError {
        result.unwrap_err().current_context().clone()
    }

    #[test(tokio::test)]
    async fn routes_by_partition_and_isolation() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;

        let cpx = service
            .allocate("card0", request("a", 0.25, IsolationType::Partition))
            .await
            .unwrap();
        assert_eq!(cpx.xcd_indices, vec![0, 1]);
        assert_eq!(
            service.route("card0", &request("x", 0.5, IsolationType::Shared)).unwrap(),
            AllocatorKind::PartitionAware
        );

        let shared = service
            .allocate("card1", request("b", 0.5, IsolationType::Shared))
            .await
            .unwrap();
        assert_eq!(shared.status, AllocationStatus::Active);

        assert_eq!(
            service.route("card1", &request("c", 0.5, IsolationType::TimeSlice)).unwrap(),
            AllocatorKind::TimeSlicing
        );
        assert_eq!(service.fractional().active_allocation_count("card1"), 1);
        assert_eq!(service.registry().get_device("card1").unwrap().active_allocations, 1);
        assert_eq!(service.list_allocations("card1").len(), 1);
    }

    #[test(tokio::test)]
    async fn unpartitioned_device_is_booked_by_one_allocator_at_a_time() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;
        let mut whole = request("shared", 1.0, IsolationType::Shared);
        whole.memory_mib = 8192;
        service.allocate("card1", whole).await.unwrap();

        let mut sliced = request("sliced", 1.0, IsolationType::TimeSlice);
        sliced.memory_mib = 8192;
        let err = error_of(service.allocate("card1", sliced.clone()).await);
        assert!(matches!(err, AllocationError::PolicyViolation { .. }));
        assert!(service.can_allocate("card1", &sliced).is_err());
        assert_eq!(service.scheduler().active_allocation_count("card1"), 0);

        service.release("shared").await.unwrap();
        let granted = service.allocate("card1", sliced).await.unwrap();
        assert_eq!(granted.status, AllocationStatus::Pending);

        let err = error_of(
            service
                .allocate("card1", request("late", 0.25, IsolationType::Shared))
                .await,
        );
        assert!(matches!(err, AllocationError::PolicyViolation { .. }));
        assert_eq!(service.fractional().active_allocation_count("card1"), 0);
    }

    #[test(tokio::test)]
    async fn ceiling_is_counted_from_the_allocators() {
        let service = service(
            UnpartitionedMode::Fractional,
            RegistryConfig {
                max_allocations_per_device: 1,
                ..Default::default()
            },
        )
        .await;
        service
            .allocate("card1", request("a", 0.25, IsolationType::Shared))
            .await
            .unwrap();

        // a registry count that lags behind the allocators
        service.registry().set_active_allocations("card1", 0).unwrap();
        assert!(service.registry().is_available("card1"));

        let err = error_of(
            service
                .allocate("card1", request("b", 0.25, IsolationType::Shared))
                .await,
        );
        assert!(matches!(err, AllocationError::ResourceExhausted { .. }));
        assert_eq!(service.fractional().active_allocation_count("card1"), 1);
    }

    #[test(tokio::test)]
    async fn time_sliced_node_routes_unpartitioned_devices_to_the_scheduler() {
        let service = service(UnpartitionedMode::TimeSliced, RegistryConfig::default()).await;
        let kind = service
            .route("card1", &request("a", 0.5, IsolationType::Shared))
            .unwrap();
        assert_eq!(kind, AllocatorKind::TimeSlicing);
    }

    #[test(tokio::test)]
    async fn release_needs_only_the_id() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;
        service
            .allocate("card0", request("a", 0.5, IsolationType::Partition))
            .await
            .unwrap();

        let released = service.release("a").await.unwrap();
        assert_eq!(released.status, AllocationStatus::Completed);
        assert_eq!(released.xcd_indices, vec![0, 1, 2, 3]);
        assert!(error_of(service.release("a").await).is_not_found());
        assert!(error_of(service.get_allocation("a")).is_not_found());
        assert_eq!(service.registry().get_device("card0").unwrap().active_allocations, 0);
    }

    #[test(tokio::test)]
    async fn duplicate_ids_are_rejected_across_allocators() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;
        service
            .allocate("card0", request("a", 0.25, IsolationType::Partition))
            .await
            .unwrap();
        let err = error_of(
            service
                .allocate("card1", request("a", 0.25, IsolationType::Shared))
                .await,
        );
        assert!(matches!(err, AllocationError::Validation { .. }));
    }

    #[test(tokio::test)]
    async fn unavailable_and_unknown_devices() {
        let service = service(
            UnpartitionedMode::Fractional,
            RegistryConfig {
                max_allocations_per_device: 1,
                ..Default::default()
            },
        )
        .await;
        service
            .allocate("card1", request("a", 0.25, IsolationType::Shared))
            .await
            .unwrap();

        let err = error_of(
            service
                .allocate("card1", request("b", 0.25, IsolationType::Shared))
                .await,
        );
        assert!(err.is_transient());
        assert!(error_of(
            service
                .allocate("card9", request("c", 0.25, IsolationType::Shared))
                .await
        )
        .is_not_found());
    }

    #[test(tokio::test)]
    async fn allocate_auto_uses_the_strategy() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;
        let first = service
            .allocate_auto(
                SelectionStrategy::FirstFit,
                request("a", 0.25, IsolationType::Shared),
            )
            .await
            .unwrap();
        assert_eq!(first.device_id, "card0");

        // card0 only accepts multiples of 1/8, 0.3 fits card1 alone
        let second = service
            .allocate_auto(
                SelectionStrategy::FirstFit,
                request("b", 0.3, IsolationType::Shared),
            )
            .await
            .unwrap();
        assert_eq!(second.device_id, "card1");
    }

    #[test(tokio::test)]
    async fn expired_allocations_are_swept_everywhere() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;
        let past = Utc::now() - TimeDelta::seconds(1);
        service
            .allocate(
                "card0",
                request("a", 0.25, IsolationType::Partition).with_expiry(past),
            )
            .await
            .unwrap();
        service
            .allocate(
                "card1",
                request("b", 0.25, IsolationType::TimeSlice).with_expiry(past),
            )
            .await
            .unwrap();
        service
            .allocate("card1", request("c", 0.25, IsolationType::TimeSlice))
            .await
            .unwrap();

        let mut expired = service
            .cleanup_expired()
            .await
            .into_iter()
            .map(|allocation| allocation.id)
            .collect::<Vec<_>>();
        expired.sort();
        assert_eq!(expired, vec!["a".to_string(), "b".to_string()]);
        assert!(error_of(service.get_allocation("a")).is_not_found());
        assert!(service.get_allocation("c").is_ok());
        assert_eq!(service.registry().get_device("card1").unwrap().active_allocations, 1);
    }

    #[test(tokio::test)]
    async fn process_isolation_sessions_follow_allocations() {
        let backend = Arc::new(RecordingBackend::default());
        let sessions = Arc::new(IsolationSessions::new(backend.clone()));
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default())
            .await
            .with_isolation(sessions.clone());

        service
            .allocate("card1", request("a", 0.25, IsolationType::Process))
            .await
            .unwrap();
        service
            .allocate("card1", request("b", 0.25, IsolationType::Process))
            .await
            .unwrap();
        service
            .allocate("card1", request("c", 0.25, IsolationType::Shared))
            .await
            .unwrap();
        assert_eq!(sessions.session_count("card1"), 2);

        service.release("a").await.unwrap();
        service.release("c").await.unwrap();
        service.release("b").await.unwrap();
        assert_eq!(
            backend.calls(),
            vec!["start card1".to_string(), "stop card1".to_string()]
        );
    }

    #[test(tokio::test)]
    async fn failed_session_start_undoes_the_allocation() {
        let backend = Arc::new(RecordingBackend {
            fail_start: true,
            ..Default::default()
        });
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default())
            .await
            .with_isolation(Arc::new(IsolationSessions::new(backend)));

        let err = error_of(
            service
                .allocate("card1", request("a", 0.5, IsolationType::Process))
                .await,
        );
        assert!(err.is_transient());
        assert!(error_of(service.get_allocation("a")).is_not_found());
        assert_eq!(service.fractional().active_allocation_count("card1"), 0);
    }

    #[test(tokio::test)]
    async fn reservations_require_a_known_device() {
        let service = service(UnpartitionedMode::Fractional, RegistryConfig::default()).await;
        let start = Utc::now() + TimeDelta::hours(1);
        let unknown =
            ReservationRequest::new("alice", "train", "card9", start, TimeDelta::hours(1));
        assert!(error_of(service.create_reservation(unknown)).is_not_found());

        let known = ReservationRequest::new("alice", "train", "card1", start, TimeDelta::hours(1));
        assert!(service.create_reservation(known).is_ok());
        assert_eq!(service.reservations().stats().pending, 1);
    }
}
