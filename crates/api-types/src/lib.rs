//! Shared API type definitions
//!
//! This crate contains the typed values exchanged between the node-local
//! allocation engine and its caller (the cluster controller): the parsed GPU
//! request of a workload, the workload identity, and the status enums the
//! controller persists onto workload status.

use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// How a workload is isolated from other tenants of the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationType {
    /// No isolation beyond the share accounting itself.
    #[default]
    Shared,
    /// Out-of-process multi-tenant server keyed by device.
    Process,
    /// Hardware partition (XCD level).
    Partition,
    /// Logical turn-taking on an unpartitioned device.
    TimeSlice,
}

impl IsolationType {
    pub const ALL: [IsolationType; 4] = [
        IsolationType::Shared,
        IsolationType::Process,
        IsolationType::Partition,
        IsolationType::TimeSlice,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            IsolationType::Shared => "shared",
            IsolationType::Process => "process",
            IsolationType::Partition => "partition",
            IsolationType::TimeSlice => "time-slice",
        }
    }
}

impl std::fmt::Display for IsolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an isolation type name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownIsolationType(pub String);

impl std::fmt::Display for UnknownIsolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown isolation type `{}`", self.0)
    }
}

impl std::error::Error for UnknownIsolationType {}

impl FromStr for IsolationType {
    type Err = UnknownIsolationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" | "none" => Ok(IsolationType::Shared),
            "process" | "mps" => Ok(IsolationType::Process),
            "partition" => Ok(IsolationType::Partition),
            "time-slice" | "timeslice" | "time-slicing" => Ok(IsolationType::TimeSlice),
            other => Err(UnknownIsolationType(other.to_string())),
        }
    }
}

/// Identity of the workload that owns an allocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    /// Pod name
    pub pod_name: String,
    /// Pod namespace
    pub namespace: String,
    /// Container name
    pub container_name: String,
}

impl WorkloadRef {
    pub fn new(
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            pod_name: pod_name.into(),
            namespace: namespace.into(),
            container_name: container_name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod_name, self.container_name)
    }
}

/// GPU request of a workload, already parsed from its annotations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuRequest {
    /// Requested share of a device, 0.1 ..= 1.0
    pub fraction: f64,
    /// Requested device memory in MiB
    pub memory_mib: u64,
    /// Whether the workload accepts co-tenants on its device
    pub sharing_enabled: bool,
    /// Requested isolation
    pub isolation_type: IsolationType,
}

impl Default for GpuRequest {
    fn default() -> Self {
        Self {
            fraction: 1.0,
            memory_mib: 0,
            sharing_enabled: false,
            isolation_type: IsolationType::Shared,
        }
    }
}

/// Lifecycle of a device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Pending,
    Active,
    Completed,
    Expired,
}

impl AllocationStatus {
    /// Whether the allocation still holds device capacity.
    pub const fn is_live(&self) -> bool {
        matches!(self, AllocationStatus::Pending | AllocationStatus::Active)
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

/// Lifecycle of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    /// Terminal reservations never transition again.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Cancelled | ReservationStatus::Expired
        )
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}
