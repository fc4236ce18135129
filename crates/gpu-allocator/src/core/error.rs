use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type using error-stack for context-rich error reporting
pub type Result<T> = core::result::Result<T, Report<AllocationError>>;

/// Kind of entity a lookup failed for.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    #[display("device")]
    Device,
    #[display("allocation")]
    Allocation,
    #[display("reservation")]
    Reservation,
}

/// Errors returned by the allocators, the scheduler and the reservation manager.
///
/// Every variant is recoverable. The caller decides whether to retry
/// ([`AllocationError::is_transient`]), surface the failure to the workload
/// owner, or treat it as already reconciled (`NotFound` on release).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The request is malformed.
    #[display("invalid request: {reason}")]
    Validation { reason: String },
    /// Not enough fraction, memory or XCDs left on the device.
    #[display("insufficient resources on {device_id}: {reason}")]
    ResourceExhausted { device_id: String, reason: String },
    /// The request is well formed but not allowed by configuration.
    #[display("policy violation: {reason}")]
    PolicyViolation { reason: String },
    /// An overlapping reservation exists and the policy rejects it.
    #[display("reservation conflict on {gpu_id}: {reason}")]
    Conflict { gpu_id: String, reason: String },
    /// A per-user or per-GPU cap is reached.
    #[display("limit exceeded: {reason}")]
    LimitExceeded { reason: String },
    #[display("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },
}

impl Error for AllocationError {}

impl AllocationError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn exhausted(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            reason: reason.into(),
        }
    }

    pub fn conflict(gpu_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            gpu_id: gpu_id.into(),
            reason: reason.into(),
        }
    }

    pub fn limit(reason: impl Into<String>) -> Self {
        Self::LimitExceeded {
            reason: reason.into(),
        }
    }

    pub fn device_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Device,
            id: id.into(),
        }
    }

    pub fn allocation_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Allocation,
            id: id.into(),
        }
    }

    pub fn reservation_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Reservation,
            id: id.into(),
        }
    }

    /// Capacity may free up later, so retrying makes sense.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
