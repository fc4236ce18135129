use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use api_types::{IsolationType, ReservationStatus};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Share;

/// What to do when a new reservation overlaps an existing one on the same GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Reject every overlap.
    #[default]
    Strict,
    /// Accept an overlap only if the newcomer agrees to share.
    Flexible,
    /// Accept every overlap.
    Overlap,
}

impl ConflictPolicy {
    /// Whether a candidate that overlaps at least one reservation is accepted.
    pub const fn permits(self, sharing_enabled: bool) -> bool {
        match self {
            ConflictPolicy::Strict => false,
            ConflictPolicy::Flexible => sharing_enabled,
            ConflictPolicy::Overlap => true,
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Strict => "strict",
            ConflictPolicy::Flexible => "flexible",
            ConflictPolicy::Overlap => "overlap",
        })
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ConflictPolicy::Strict),
            "flexible" => Ok(ConflictPolicy::Flexible),
            "overlap" => Ok(ConflictPolicy::Overlap),
            other => Err(format!(
                "unknown conflict policy `{other}`, expected strict, flexible or overlap"
            )),
        }
    }
}

/// Limits and behaviour of the reservation manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationConfig {
    pub conflict_policy: ConflictPolicy,
    pub max_reservation_duration: TimeDelta,
    /// Pending plus active reservations a single user may hold.
    pub max_reservations_per_user: usize,
    /// Pending plus active reservations on a single GPU.
    pub max_reservations_per_gpu: usize,
    pub sweep_interval: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::Strict,
            max_reservation_duration: TimeDelta::hours(24),
            max_reservations_per_user: 10,
            max_reservations_per_gpu: 20,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Request to hold a GPU for a future window.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    pub user_id: String,
    pub workload_id: String,
    pub gpu_id: String,
    pub fraction: f64,
    pub memory_mib: u64,
    pub start_time: DateTime<Utc>,
    pub duration: TimeDelta,
    pub priority: i32,
    pub isolation_type: IsolationType,
    pub sharing_enabled: bool,
}

impl ReservationRequest {
    pub fn new(
        user_id: impl Into<String>,
        workload_id: impl Into<String>,
        gpu_id: impl Into<String>,
        start_time: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            workload_id: workload_id.into(),
            gpu_id: gpu_id.into(),
            fraction: 1.0,
            memory_mib: 0,
            start_time,
            duration,
            priority: 0,
            isolation_type: IsolationType::default(),
            sharing_enabled: false,
        }
    }

    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction;
        self
    }

    pub fn with_memory_mib(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sharing(mut self, sharing_enabled: bool) -> Self {
        self.sharing_enabled = sharing_enabled;
        self
    }
}

/// A time-windowed hold on a GPU.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub workload_id: String,
    pub gpu_id: String,
    pub fraction: Share,
    pub memory_mib: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub priority: i32,
    pub status: ReservationStatus,
    pub isolation_type: IsolationType,
    pub sharing_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn duration(&self) -> TimeDelta {
        self.end_time - self.start_time
    }

    /// Closed-interval overlap with `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        !(end < self.start_time || start > self.end_time)
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Partial update of a reservation. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservationPatch {
    pub workload_id: Option<String>,
    pub fraction: Option<f64>,
    pub memory_mib: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<TimeDelta>,
    pub priority: Option<i32>,
    pub isolation_type: Option<IsolationType>,
    pub sharing_enabled: Option<bool>,
}

/// Reservation counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub expired: usize,
}

impl ReservationStats {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.completed + self.cancelled + self.expired
    }

    pub(crate) fn count(&mut self, status: ReservationStatus) {
        match status {
            ReservationStatus::Pending => self.pending += 1,
            ReservationStatus::Active => self.active += 1,
            ReservationStatus::Completed => self.completed += 1,
            ReservationStatus::Cancelled => self.cancelled += 1,
            ReservationStatus::Expired => self.expired += 1,
        }
    }
}

/// Reservations whose status the sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Activated ids, earliest start first, then highest priority.
    pub activated: Vec<String>,
    pub expired: Vec<String>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.expired.is_empty()
    }
}
