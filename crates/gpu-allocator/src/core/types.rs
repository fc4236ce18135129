//! Core type definitions shared by the allocation components.

use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

use api_types::{AllocationStatus, GpuRequest, IsolationType, WorkloadRef};
use chrono::{DateTime, TimeDelta, Utc};
use error_stack::report;
use serde::{Deserialize, Serialize};

use super::error::{AllocationError, Result};

pub const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Number of compute dies on the supported chiplet device.
pub const XCD_COUNT: u8 = 8;

pub const fn bytes_to_mib(bytes: u64) -> u64 {
    bytes / BYTES_PER_MIB
}

pub const fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(BYTES_PER_MIB)
}

/// A share of one device in thousandths (1000 is the whole device).
///
/// Sums and comparisons are exact integer arithmetic; floating point only
/// appears when a caller-supplied fraction is converted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Share(u32);

impl Share {
    pub const SCALE: u32 = 1000;
    pub const ZERO: Share = Share(0);
    pub const WHOLE: Share = Share(Self::SCALE);
    pub const MIN_FRACTION: f64 = 0.1;
    pub const MAX_FRACTION: f64 = 1.0;

    pub const fn from_millis(millis: u32) -> Self {
        Self(millis)
    }

    /// Validates `fraction` against `[0.1, 1.0]` and converts it.
    pub fn from_fraction(fraction: f64) -> Result<Self> {
        if !(Self::MIN_FRACTION..=Self::MAX_FRACTION).contains(&fraction) {
            return Err(report!(AllocationError::validation(format!(
                "fraction {fraction} is outside [{}, {}]",
                Self::MIN_FRACTION,
                Self::MAX_FRACTION
            ))));
        }
        Ok(Self::nearest(fraction))
    }

    /// Rounds a fraction to the nearest thousandth, clamped to `[0, 1]`.
    pub fn nearest(fraction: f64) -> Self {
        let millis = (fraction * f64::from(Self::SCALE)).round();
        Self(millis.clamp(0.0, f64::from(Self::SCALE)) as u32)
    }

    pub const fn millis(self) -> u32 {
        self.0
    }

    pub fn as_fraction(self) -> f64 {
        f64::from(self.0) / f64::from(Self::SCALE)
    }

    pub const fn is_whole(self) -> bool {
        self.0 >= Self::SCALE
    }

    pub const fn saturating_add(self, other: Share) -> Share {
        Share(self.0.saturating_add(other.0))
    }

    pub const fn saturating_sub(self, other: Share) -> Share {
        Share(self.0.saturating_sub(other.0))
    }

    /// Share still free when `self` is in use.
    pub const fn remaining(self) -> Share {
        Self::WHOLE.saturating_sub(self)
    }

    /// Number of XCDs a share spans: `ceil(share * 8)`.
    pub const fn xcds(self) -> u8 {
        let scaled = self.0 * XCD_COUNT as u32;
        scaled.div_ceil(Self::SCALE) as u8
    }
}

impl Sum for Share {
    fn sum<I: Iterator<Item = Share>>(iter: I) -> Self {
        iter.fold(Share::ZERO, Share::saturating_add)
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.as_fraction())
    }
}

/// Compute partitioning mode of a chiplet device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComputeMode {
    /// All XCDs form one logical device.
    Spx,
    /// Every XCD is its own logical device.
    Cpx,
    /// Three-way split, not hardware verified.
    Tpx,
}

impl fmt::Display for ComputeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComputeMode::Spx => "SPX",
            ComputeMode::Cpx => "CPX",
            ComputeMode::Tpx => "TPX",
        })
    }
}

impl FromStr for ComputeMode {
    type Err = error_stack::Report<AllocationError>;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPX" => Ok(ComputeMode::Spx),
            "CPX" => Ok(ComputeMode::Cpx),
            "TPX" => Ok(ComputeMode::Tpx),
            other => Err(report!(AllocationError::validation(format!(
                "unknown compute partition mode `{other}`"
            )))),
        }
    }
}

/// Memory partitioning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryMode {
    /// One unified memory pool.
    Nps1,
    /// Quadrant-partitioned memory.
    Nps4,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryMode::Nps1 => "NPS1",
            MemoryMode::Nps4 => "NPS4",
        })
    }
}

impl FromStr for MemoryMode {
    type Err = error_stack::Report<AllocationError>;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NPS1" => Ok(MemoryMode::Nps1),
            "NPS4" => Ok(MemoryMode::Nps4),
            other => Err(report!(AllocationError::validation(format!(
                "unknown memory partition mode `{other}`"
            )))),
        }
    }
}

/// Hardware partition configuration of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionConfig {
    pub compute_mode: ComputeMode,
    pub memory_mode: MemoryMode,
    #[serde(default = "default_xcd_count")]
    pub xcd_count: u8,
}

fn default_xcd_count() -> u8 {
    XCD_COUNT
}

impl PartitionConfig {
    pub const fn new(compute_mode: ComputeMode, memory_mode: MemoryMode) -> Self {
        Self {
            compute_mode,
            memory_mode,
            xcd_count: XCD_COUNT,
        }
    }

    /// Checks the hardware invariants of the configuration.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::Validation`] if `xcd_count` is not 8
    /// - [`AllocationError::PolicyViolation`] for SPX combined with NPS4
    pub fn validate(&self) -> Result<()> {
        if self.xcd_count != XCD_COUNT {
            return Err(report!(AllocationError::validation(format!(
                "xcd_count must be {XCD_COUNT}, got {}",
                self.xcd_count
            ))));
        }
        if self.compute_mode == ComputeMode::Spx && self.memory_mode == MemoryMode::Nps4 {
            return Err(report!(AllocationError::policy(
                "SPX compute mode is incompatible with NPS4 memory mode"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PartitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.compute_mode, self.memory_mode)
    }
}

/// Request to place one workload on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    pub id: String,
    pub workload: WorkloadRef,
    pub fraction: f64,
    pub memory_mib: u64,
    pub isolation_type: IsolationType,
    pub sharing_enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AllocationRequest {
    pub fn new(id: impl Into<String>, workload: WorkloadRef, request: &GpuRequest) -> Self {
        Self {
            id: id.into(),
            workload,
            fraction: request.fraction,
            memory_mib: request.memory_mib,
            isolation_type: request.isolation_type,
            sharing_enabled: request.sharing_enabled,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_ttl(self, ttl: TimeDelta) -> Self {
        self.with_expiry(Utc::now() + ttl)
    }
}

/// A granted share of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuAllocation {
    pub id: String,
    pub device_id: String,
    pub workload: WorkloadRef,
    pub share: Share,
    pub memory_mib: u64,
    pub isolation_type: IsolationType,
    pub sharing_enabled: bool,
    pub status: AllocationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// XCD indices owned on partitioned devices, ascending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xcd_indices: Vec<u8>,
}

impl GpuAllocation {
    pub(crate) fn from_request(
        device_id: &str,
        request: AllocationRequest,
        share: Share,
        status: AllocationStatus,
    ) -> Self {
        Self {
            id: request.id,
            device_id: device_id.to_string(),
            workload: request.workload,
            share,
            memory_mib: request.memory_mib,
            isolation_type: request.isolation_type,
            sharing_enabled: request.sharing_enabled,
            status,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            xcd_indices: Vec::new(),
        }
    }

    pub fn fraction(&self) -> f64 {
        self.share.as_fraction()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Capacity an allocator needs to know about a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapacity {
    pub device_id: String,
    pub memory_total_mib: u64,
}

impl DeviceCapacity {
    pub fn new(device_id: impl Into<String>, memory_total_mib: u64) -> Self {
        Self {
            device_id: device_id.into(),
            memory_total_mib,
        }
    }
}

/// Point-in-time usage of one device as seen by one allocator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUsage {
    pub device_id: String,
    pub share_used: Share,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
    pub active_allocations: usize,
    /// Free compute dies, only for XCD-tracked devices.
    pub free_xcds: Option<u8>,
}

impl DeviceUsage {
    pub fn utilization_rate(&self) -> f64 {
        self.share_used.as_fraction()
    }

    pub fn memory_utilization_rate(&self) -> f64 {
        if self.memory_total_mib == 0 {
            return 1.0;
        }
        self.memory_used_mib as f64 / self.memory_total_mib as f64
    }

    pub fn memory_free_mib(&self) -> u64 {
        self.memory_total_mib.saturating_sub(self.memory_used_mib)
    }

    /// Lower is a better fit: `0.6 * utilization + 0.4 * memory utilization`.
    pub fn fit_score(&self) -> f64 {
        0.6 * self.utilization_rate() + 0.4 * self.memory_utilization_rate()
    }

    /// Lower is less loaded: `0.7 * utilization + 0.3 * allocations / 10`.
    pub fn load_score(&self) -> f64 {
        0.7 * self.utilization_rate() + 0.3 * (self.active_allocations as f64 / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_rejects_out_of_range_fractions() {
        assert!(Share::from_fraction(0.05).is_err());
        assert!(Share::from_fraction(1.01).is_err());
        assert!(Share::from_fraction(f64::NAN).is_err());
        assert_eq!(Share::from_fraction(0.1).unwrap().millis(), 100);
        assert_eq!(Share::from_fraction(1.0).unwrap(), Share::WHOLE);
    }

    #[test]
    fn share_sums_exactly() {
        let parts = [0.1, 0.2, 0.3, 0.4].map(|f| Share::from_fraction(f).unwrap());
        let total: Share = parts.into_iter().sum();
        assert_eq!(total, Share::WHOLE);
        assert_eq!(total.remaining(), Share::ZERO);
    }

    #[test]
    fn share_maps_to_xcd_counts() {
        assert_eq!(Share::from_millis(125).xcds(), 1);
        assert_eq!(Share::from_millis(250).xcds(), 2);
        assert_eq!(Share::from_millis(375).xcds(), 3);
        assert_eq!(Share::from_millis(126).xcds(), 2);
        assert_eq!(Share::WHOLE.xcds(), 8);
    }

    #[test]
    fn partition_config_invariants() {
        assert!(PartitionConfig::new(ComputeMode::Cpx, MemoryMode::Nps4)
            .validate()
            .is_ok());

        let err = PartitionConfig::new(ComputeMode::Spx, MemoryMode::Nps4)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            AllocationError::PolicyViolation { .. }
        ));

        let mut config = PartitionConfig::new(ComputeMode::Cpx, MemoryMode::Nps1);
        config.xcd_count = 6;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.current_context(),
            AllocationError::Validation { .. }
        ));
    }

    #[test]
    fn unknown_modes_are_validation_errors() {
        let err = "DPX".parse::<ComputeMode>().unwrap_err();
        assert!(matches!(
            err.current_context(),
            AllocationError::Validation { .. }
        ));
        assert!("nps2".parse::<MemoryMode>().is_err());
        assert_eq!("cpx".parse::<ComputeMode>().unwrap(), ComputeMode::Cpx);
    }

    #[test]
    fn usage_scores() {
        let usage = DeviceUsage {
            device_id: "card0".to_string(),
            share_used: Share::from_millis(500),
            memory_used_mib: 4096,
            memory_total_mib: 8192,
            active_allocations: 2,
            free_xcds: None,
        };
        assert!((usage.fit_score() - 0.5).abs() < 1e-9);
        assert!((usage.load_score() - (0.35 + 0.06)).abs() < 1e-9);
    }
}
