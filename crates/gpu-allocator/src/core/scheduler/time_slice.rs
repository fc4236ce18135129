//! Cooperative turn-taking on devices without hardware partitioning.
//!
//! Every allocation on a device is queued FIFO. An external driver calls
//! [`TimeSlicingScheduler::update_scheduling`] on a cadence; once the time
//! slice has elapsed the active workload goes back to the tail of the queue
//! and the head becomes active. Only the turn is tracked, running kernels are
//! never preempted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use api_types::AllocationStatus;
use chrono::{DateTime, Utc};
use error_stack::report;
use serde::Serialize;

use super::SchedulerConfig;
use crate::core::allocator::{AllocatorKind, GpuAllocator};
use crate::core::error::{AllocationError, Result};
use crate::core::lock;
use crate::core::policy::AllocationPolicy;
use crate::core::types::{AllocationRequest, DeviceCapacity, DeviceUsage, GpuAllocation, Share};

/// Outcome of a rotation that actually happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub previous: Option<String>,
    pub current: Option<String>,
}

/// Point-in-time view of one device's turn-taking state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub device_id: String,
    pub time_slice: Duration,
    pub active_workload: Option<String>,
    /// Waiting allocation ids, head first.
    pub queue: Vec<String>,
    pub since_last_switch: Duration,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

#[derive(Debug)]
struct SlicedDevice {
    memory_total_mib: u64,
    memory_used_mib: u64,
    workloads: Vec<GpuAllocation>,
    queue: VecDeque<String>,
    active: Option<String>,
    last_switch: Instant,
}

impl SlicedDevice {
    fn new(memory_total_mib: u64, now: Instant) -> Self {
        Self {
            memory_total_mib,
            memory_used_mib: 0,
            workloads: Vec::new(),
            queue: VecDeque::new(),
            active: None,
            last_switch: now,
        }
    }

    fn set_status(&mut self, allocation_id: &str, status: AllocationStatus) {
        if let Some(workload) = self.workloads.iter_mut().find(|w| w.id == allocation_id) {
            workload.status = status;
        }
    }

    fn remove(&mut self, allocation_id: &str) -> Option<GpuAllocation> {
        let position = self.workloads.iter().position(|w| w.id == allocation_id)?;
        let allocation = self.workloads.remove(position);
        self.queue.retain(|id| id != allocation_id);
        if self.active.as_deref() == Some(allocation_id) {
            self.active = None;
        }
        self.memory_used_mib = self.memory_used_mib.saturating_sub(allocation.memory_mib);
        Some(allocation)
    }

    fn rotate(&mut self, now: Instant) -> Rotation {
        let previous = self.active.take();
        if let Some(id) = &previous {
            self.set_status(id, AllocationStatus::Pending);
            self.queue.push_back(id.clone());
        }
        let current = self.queue.pop_front();
        if let Some(id) = &current {
            self.set_status(id, AllocationStatus::Active);
        }
        self.active = current.clone();
        self.last_switch = now;
        Rotation { previous, current }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    devices: BTreeMap<String, SlicedDevice>,
    /// allocation id -> device id
    owners: HashMap<String, String>,
}

/// Emulates fractional sharing by handing out whole-device turns.
///
/// The requested fraction is kept as a priority hint only; admission checks
/// memory alone.
#[derive(Debug, Default)]
pub struct TimeSlicingScheduler {
    config: SchedulerConfig,
    policy: AllocationPolicy,
    state: RwLock<SchedulerState>,
}

impl TimeSlicingScheduler {
    pub fn new(config: SchedulerConfig, policy: AllocationPolicy) -> Self {
        Self {
            config,
            policy,
            state: RwLock::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Adds a device or updates its memory total.
    ///
    /// A zero memory total means the registry did not report one, the
    /// configured default is used instead.
    pub fn register_device(&self, capacity: DeviceCapacity) {
        let memory_total_mib = self.effective_memory(capacity.memory_total_mib);
        let mut state = lock::write(&self.state);
        state
            .devices
            .entry(capacity.device_id.clone())
            .and_modify(|device| device.memory_total_mib = memory_total_mib)
            .or_insert_with(|| {
                tracing::debug!(
                    device_id = %capacity.device_id,
                    memory_mib = memory_total_mib,
                    "registered time-sliced device"
                );
                SlicedDevice::new(memory_total_mib, Instant::now())
            });
    }

    fn effective_memory(&self, reported_mib: u64) -> u64 {
        if reported_mib == 0 {
            self.config.default_memory_mib
        } else {
            reported_mib
        }
    }

    fn check(
        &self,
        state: &SchedulerState,
        device_id: &str,
        request: &AllocationRequest,
    ) -> Result<Share> {
        let share = self.policy.admit(request)?;
        if state.owners.contains_key(&request.id) {
            return Err(report!(AllocationError::validation(format!(
                "allocation id `{}` is already in use",
                request.id
            ))));
        }
        let (used, total) = state
            .devices
            .get(device_id)
            .map(|device| (device.memory_used_mib, device.memory_total_mib))
            .unwrap_or((0, self.config.default_memory_mib));
        let free = total.saturating_sub(used);
        if request.memory_mib > free {
            return Err(report!(AllocationError::exhausted(
                device_id,
                format!("requested {} MiB, only {free} MiB free", request.memory_mib)
            )));
        }
        Ok(share)
    }

    /// Rotates the turn on `device_id` if its time slice has elapsed.
    ///
    /// Returns `None` when the slice has not elapsed yet.
    pub fn update_scheduling(&self, device_id: &str) -> Result<Option<Rotation>> {
        self.update_scheduling_at(device_id, Instant::now())
    }

    pub fn update_scheduling_at(&self, device_id: &str, now: Instant) -> Result<Option<Rotation>> {
        let mut state = lock::write(&self.state);
        let device = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))?;

        if now.saturating_duration_since(device.last_switch) < self.config.time_slice {
            return Ok(None);
        }
        let rotation = device.rotate(now);
        if rotation.previous != rotation.current {
            tracing::debug!(
                device_id,
                previous = ?rotation.previous,
                current = ?rotation.current,
                "rotated time slice"
            );
        }
        Ok(Some(rotation))
    }

    /// Rotates every device whose slice has elapsed.
    pub fn update_all(&self) -> Vec<(String, Rotation)> {
        let now = Instant::now();
        self.device_ids()
            .into_iter()
            .filter_map(|device_id| {
                let rotation = self.update_scheduling_at(&device_id, now).ok().flatten()?;
                Some((device_id, rotation))
            })
            .collect()
    }

    pub fn scheduler_state(&self, device_id: &str) -> Result<SchedulerSnapshot> {
        let state = lock::read(&self.state);
        let device = state
            .devices
            .get(device_id)
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))?;
        Ok(SchedulerSnapshot {
            device_id: device_id.to_string(),
            time_slice: self.config.time_slice,
            active_workload: device.active.clone(),
            queue: device.queue.iter().cloned().collect(),
            since_last_switch: device.last_switch.elapsed(),
            memory_used_mib: device.memory_used_mib,
            memory_total_mib: device.memory_total_mib,
        })
    }
}

impl GpuAllocator for TimeSlicingScheduler {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::TimeSlicing
    }

    fn device_ids(&self) -> Vec<String> {
        lock::read(&self.state).devices.keys().cloned().collect()
    }

    fn can_allocate(&self, device_id: &str, request: &AllocationRequest) -> Result<()> {
        let state = lock::read(&self.state);
        self.check(&state, device_id, request).map(|_| ())
    }

    /// Queues the workload as pending on `device_id`.
    ///
    /// A device the scheduler has not seen yet is added with the default
    /// memory capacity.
    #[tracing::instrument(skip(self, request), fields(allocation_id = %request.id, memory_mib = request.memory_mib))]
    fn allocate(&self, device_id: &str, request: AllocationRequest) -> Result<GpuAllocation> {
        let mut state = lock::write(&self.state);
        let share = self.check(&state, device_id, &request)?;
        let state = &mut *state;

        let device = state.devices.entry(device_id.to_string()).or_insert_with(|| {
            tracing::warn!(
                memory_mib = self.config.default_memory_mib,
                "device has no registered capacity, using default"
            );
            SlicedDevice::new(self.config.default_memory_mib, Instant::now())
        });
        let allocation =
            GpuAllocation::from_request(device_id, request, share, AllocationStatus::Pending);
        device.memory_used_mib += allocation.memory_mib;
        device.queue.push_back(allocation.id.clone());
        device.workloads.push(allocation.clone());
        state
            .owners
            .insert(allocation.id.clone(), device_id.to_string());

        tracing::info!(queue_len = device.queue.len(), "queued time-sliced workload");
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
        tracing::info!(device_id = %device_id, "released time-sliced workload");
        Ok(allocation)
    }

    fn get_allocation(&self, allocation_id: &str) -> Result<GpuAllocation> {
        let state = lock::read(&self.state);
        state
            .owners
            .get(allocation_id)
            .and_then(|device_id| state.devices.get(device_id))
            .and_then(|device| device.workloads.iter().find(|w| w.id == allocation_id))
            .cloned()
            .ok_or_else(|| report!(AllocationError::allocation_not_found(allocation_id)))
    }

    fn list_allocations(&self, device_id: &str) -> Result<Vec<GpuAllocation>> {
        lock::read(&self.state)
            .devices
            .get(device_id)
            .map(|device| device.workloads.clone())
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))
    }

    /// `share_used` is the share of the workload holding the current turn.
    fn device_usage(&self, device_id: &str) -> Result<DeviceUsage> {
        let state = lock::read(&self.state);
        let device = state
            .devices
            .get(device_id)
            .ok_or_else(|| report!(AllocationError::device_not_found(device_id)))?;
        let share_used = device
            .active
            .as_deref()
            .and_then(|id| device.workloads.iter().find(|w| w.id == id))
            .map_or(Share::ZERO, |w| w.share);
        Ok(DeviceUsage {
            device_id: device_id.to_string(),
            share_used,
            memory_used_mib: device.memory_used_mib,
            memory_total_mib: device.memory_total_mib,
            active_allocations: device.workloads.len(),
            free_xcds: None,
        })
    }

    fn active_allocation_count(&self, device_id: &str) -> usize {
        lock::read(&self.state)
            .devices
            .get(device_id)
            .map_or(0, |device| device.workloads.len())
    }

    fn cleanup_expired_allocations_at(&self, now: DateTime<Utc>) -> Vec<GpuAllocation> {
        let mut state = lock::write(&self.state);
        let state = &mut *state;
        let mut expired = Vec::new();
        for device in state.devices.values_mut() {
            let ids = device
                .workloads
                .iter()
                .filter(|w| w.is_expired_at(now))
                .map(|w| w.id.clone())
                .collect::<Vec<_>>();
            expired.extend(ids.iter().filter_map(|id| device.remove(id)));
        }
        for allocation in &mut expired {
            state.owners.remove(&allocation.id);
            allocation.status = AllocationStatus::Expired;
            tracing::info!(
                allocation_id = %allocation.id,
                device_id = %allocation.device_id,
                "time-sliced workload expired"
            );
        }
        expired
    }
}
