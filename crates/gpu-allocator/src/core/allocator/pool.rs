//! Capacity accounting for one device: fraction and memory.

use chrono::{DateTime, Utc};
use error_stack::report;

use crate::core::error::{AllocationError, Result};
use crate::core::types::{DeviceUsage, GpuAllocation, Share};

/// Live allocations of one device and the memory they may draw from.
#[derive(Debug, Clone)]
pub(crate) struct SharePool {
    memory_total_mib: u64,
    allocations: Vec<GpuAllocation>,
}

impl SharePool {
    pub(crate) fn new(memory_total_mib: u64) -> Self {
        Self {
            memory_total_mib,
            allocations: Vec::new(),
        }
    }

    pub(crate) fn memory_total_mib(&self) -> u64 {
        self.memory_total_mib
    }

    pub(crate) fn set_memory_total_mib(&mut self, memory_total_mib: u64) {
        self.memory_total_mib = memory_total_mib;
    }

    pub(crate) fn share_used(&self) -> Share {
        self.allocations.iter().map(|a| a.share).sum()
    }

    pub(crate) fn memory_used_mib(&self) -> u64 {
        self.allocations.iter().map(|a| a.memory_mib).sum()
    }

    pub(crate) fn memory_free_mib(&self) -> u64 {
        self.memory_total_mib.saturating_sub(self.memory_used_mib())
    }

    pub(crate) fn len(&self) -> usize {
        self.allocations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Fails when the share does not fit into what is left of the device.
    pub(crate) fn check_share(&self, device_id: &str, share: Share) -> Result<()> {
        let free = self.share_used().remaining();
        if share > free {
            return Err(report!(AllocationError::exhausted(
                device_id,
                format!("requested fraction {share}, only {free} free")
            )));
        }
        Ok(())
    }

    pub(crate) fn check_memory(&self, device_id: &str, memory_mib: u64) -> Result<()> {
        let free = self.memory_free_mib();
        if memory_mib > free {
            return Err(report!(AllocationError::exhausted(
                device_id,
                format!("requested {memory_mib} MiB, only {free} MiB free")
            )));
        }
        Ok(())
    }

    pub(crate) fn check(&self, device_id: &str, share: Share, memory_mib: u64) -> Result<()> {
        self.check_share(device_id, share)?;
        self.check_memory(device_id, memory_mib)
    }

    pub(crate) fn push(&mut self, allocation: GpuAllocation) {
        self.allocations.push(allocation);
    }

    pub(crate) fn remove(&mut self, allocation_id: &str) -> Option<GpuAllocation> {
        let position = self.allocations.iter().position(|a| a.id == allocation_id)?;
        Some(self.allocations.remove(position))
    }

    pub(crate) fn get(&self, allocation_id: &str) -> Option<&GpuAllocation> {
        self.allocations.iter().find(|a| a.id == allocation_id)
    }

    pub(crate) fn allocations(&self) -> &[GpuAllocation] {
        &self.allocations
    }

    /// Removes and returns every allocation expired at `now`.
    pub(crate) fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<GpuAllocation> {
        let (expired, live) = std::mem::take(&mut self.allocations)
            .into_iter()
            .partition(|a| a.is_expired_at(now));
        self.allocations = live;
        expired
    }

    pub(crate) fn usage(&self, device_id: &str) -> DeviceUsage {
        DeviceUsage {
            device_id: device_id.to_string(),
            share_used: self.share_used(),
            memory_used_mib: self.memory_used_mib(),
            memory_total_mib: self.memory_total_mib,
            active_allocations: self.allocations.len(),
            free_xcds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use api_types::{AllocationStatus, IsolationType, WorkloadRef};
    use chrono::TimeDelta;

    use super::*;

    fn allocation(id: &str, millis: u32, memory_mib: u64) -> GpuAllocation {
        GpuAllocation {
            id: id.to_string(),
            device_id: "card0".to_string(),
            workload: WorkloadRef::new("default", id, "main"),
            share: Share::from_millis(millis),
            memory_mib,
            isolation_type: IsolationType::Shared,
            sharing_enabled: true,
            status: AllocationStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
            xcd_indices: Vec::new(),
        }
    }

    #[test]
    fn pool_tracks_share_and_memory() {
        let mut pool = SharePool::new(8192);
        pool.push(allocation("a", 600, 4096));
        assert!(pool.check("card0", Share::from_millis(400), 4096).is_ok());
        assert!(pool.check("card0", Share::from_millis(401), 1).is_err());
        assert!(pool.check("card0", Share::from_millis(100), 4097).is_err());

        assert_eq!(pool.remove("a").map(|a| a.id), Some("a".to_string()));
        assert!(pool.is_empty());
        assert_eq!(pool.memory_free_mib(), 8192);
    }

    #[test]
    fn drain_expired_keeps_live_allocations() {
        let now = Utc::now();
        let mut pool = SharePool::new(1024);
        let mut old = allocation("old", 200, 0);
        old.expires_at = Some(now - TimeDelta::seconds(1));
        let mut fresh = allocation("fresh", 200, 0);
        fresh.expires_at = Some(now + TimeDelta::hours(1));
        pool.push(old);
        pool.push(fresh);
        pool.push(allocation("forever", 200, 0));

        let expired = pool.drain_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
        assert_eq!(pool.len(), 2);
    }
}
