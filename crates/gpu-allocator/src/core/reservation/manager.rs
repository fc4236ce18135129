//! Reservation bookkeeping, conflict resolution and the expiry sweep.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use api_types::ReservationStatus;
use chrono::{DateTime, TimeDelta, Utc};
use error_stack::report;
use priority_queue::PriorityQueue;
use tokio_util::sync::CancellationToken;

use super::types::{
    Reservation, ReservationConfig, ReservationPatch, ReservationRequest, ReservationStats,
    SweepOutcome,
};
use crate::core::error::{AllocationError, Result};
use crate::core::lock;
use crate::core::types::Share;

#[derive(Debug, Default)]
struct ReservationState {
    reservations: BTreeMap<String, Reservation>,
}

impl ReservationState {
    fn get(&self, reservation_id: &str) -> Result<&Reservation> {
        self.reservations
            .get(reservation_id)
            .ok_or_else(|| report!(AllocationError::reservation_not_found(reservation_id)))
    }

    fn get_mut(&mut self, reservation_id: &str) -> Result<&mut Reservation> {
        self.reservations
            .get_mut(reservation_id)
            .ok_or_else(|| report!(AllocationError::reservation_not_found(reservation_id)))
    }

    fn conflicts<'a>(
        &'a self,
        gpu_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Reservation> + 'a {
        self.reservations.values().filter(move |existing| {
            existing.gpu_id == gpu_id
                && existing.is_live()
                && Some(existing.id.as_str()) != exclude
                && existing.overlaps(start, end)
        })
    }

    fn live_count(&self, matches: impl Fn(&Reservation) -> bool) -> usize {
        self.reservations
            .values()
            .filter(|r| r.is_live() && matches(r))
            .count()
    }

    fn next_id(&self, user_id: &str, gpu_id: &str, now: DateTime<Utc>) -> String {
        let base = format!("res-{user_id}-{gpu_id}-{}", now.timestamp());
        if !self.reservations.contains_key(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|candidate| !self.reservations.contains_key(candidate))
            .unwrap_or(base)
    }
}

/// Owns every reservation of the node.
///
/// Two live reservations conflict when they target the same GPU and their
/// closed windows overlap. Whether a conflict rejects the newcomer is decided
/// by [`ConflictPolicy`](super::ConflictPolicy); the per-user and per-GPU caps
/// apply under every policy.
#[derive(Debug, Default)]
pub struct ReservationManager {
    config: ReservationConfig,
    state: RwLock<ReservationState>,
}

impl ReservationManager {
    pub fn new(config: ReservationConfig) -> Self {
        Self {
            config,
            state: RwLock::default(),
        }
    }

    pub fn config(&self) -> &ReservationConfig {
        &self.config
    }

    pub fn create_reservation(&self, request: ReservationRequest) -> Result<Reservation> {
        self.create_reservation_at(request, Utc::now())
    }

    /// # Errors
    ///
    /// - [`AllocationError::Validation`] for missing ids, a fraction outside
    ///   `[0.1, 1.0]`, a duration outside `(0, max]` or a start in the past
    /// - [`AllocationError::LimitExceeded`] when the user or GPU cap is reached
    /// - [`AllocationError::Conflict`] when an overlap is not permitted
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, gpu_id = %request.gpu_id))]
    pub fn create_reservation_at(
        &self,
        request: ReservationRequest,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        validate_required(&request)?;
        let fraction = Share::from_fraction(request.fraction)?;
        self.validate_window(request.start_time, request.duration, now)?;
        let end_time = end_of_window(request.start_time, request.duration)?;

        let mut state = lock::write(&self.state);
        self.check_caps(&state, &request.user_id, &request.gpu_id)?;
        self.check_conflicts(
            &state,
            &request.gpu_id,
            request.start_time,
            end_time,
            request.sharing_enabled,
            None,
        )?;

        let status = if request.start_time <= now {
            ReservationStatus::Active
        } else {
            ReservationStatus::Pending
        };
        let reservation = Reservation {
            id: state.next_id(&request.user_id, &request.gpu_id, now),
            user_id: request.user_id,
            workload_id: request.workload_id,
            gpu_id: request.gpu_id,
            fraction,
            memory_mib: request.memory_mib,
            start_time: request.start_time,
            end_time,
            priority: request.priority,
            status,
            isolation_type: request.isolation_type,
            sharing_enabled: request.sharing_enabled,
            created_at: now,
            updated_at: now,
        };
        state
            .reservations
            .insert(reservation.id.clone(), reservation.clone());

        tracing::info!(
            reservation_id = %reservation.id,
            start = %reservation.start_time,
            end = %reservation.end_time,
            status = %reservation.status,
            "created reservation"
        );
        Ok(reservation)
    }

    pub fn update_reservation(
        &self,
        reservation_id: &str,
        patch: ReservationPatch,
    ) -> Result<Reservation> {
        self.update_reservation_at(reservation_id, patch, Utc::now())
    }

    /// Applies `patch` to a live reservation.
    ///
    /// Changed fraction, start and duration are validated as on creation.
    /// Conflicts are checked again, ignoring the reservation itself, when the
    /// window moves or `sharing_enabled` is withdrawn.
    #[tracing::instrument(skip(self, patch))]
    pub fn update_reservation_at(
        &self,
        reservation_id: &str,
        patch: ReservationPatch,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let mut state = lock::write(&self.state);
        let current = state.get(reservation_id)?.clone();
        if current.status.is_terminal() {
            return Err(report!(AllocationError::validation(format!(
                "reservation {reservation_id} is already {}",
                current.status
            ))));
        }

        let mut updated = current.clone();
        if let Some(workload_id) = patch.workload_id {
            updated.workload_id = workload_id;
        }
        if let Some(fraction) = patch.fraction {
            updated.fraction = Share::from_fraction(fraction)?;
        }
        if let Some(memory_mib) = patch.memory_mib {
            updated.memory_mib = memory_mib;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        if let Some(isolation_type) = patch.isolation_type {
            updated.isolation_type = isolation_type;
        }
        if let Some(sharing_enabled) = patch.sharing_enabled {
            updated.sharing_enabled = sharing_enabled;
        }

        let window_changed = patch.start_time.is_some() || patch.duration.is_some();
        if window_changed {
            let start_time = patch.start_time.unwrap_or(current.start_time);
            let duration = patch.duration.unwrap_or_else(|| current.duration());
            if patch.start_time.is_some() {
                self.validate_window(start_time, duration, now)?;
            } else {
                self.validate_duration(duration)?;
            }
            updated.start_time = start_time;
            updated.end_time = end_of_window(start_time, duration)?;
            if updated.status == ReservationStatus::Pending && updated.start_time <= now {
                updated.status = ReservationStatus::Active;
            }
        }
        if window_changed || (current.sharing_enabled && !updated.sharing_enabled) {
            self.check_conflicts(
                &state,
                &updated.gpu_id,
                updated.start_time,
                updated.end_time,
                updated.sharing_enabled,
                Some(reservation_id),
            )?;
        }
        updated.updated_at = now;

        *state.get_mut(reservation_id)? = updated.clone();
        tracing::info!(
            start = %updated.start_time,
            end = %updated.end_time,
            "updated reservation"
        );
        Ok(updated)
    }

    pub fn cancel_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        self.finish(reservation_id, ReservationStatus::Cancelled)
    }

    pub fn complete_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        self.finish(reservation_id, ReservationStatus::Completed)
    }

    fn finish(&self, reservation_id: &str, status: ReservationStatus) -> Result<Reservation> {
        let mut state = lock::write(&self.state);
        let reservation = state.get_mut(reservation_id)?;
        if reservation.status.is_terminal() {
            return Err(report!(AllocationError::validation(format!(
                "reservation {reservation_id} is already {}",
                reservation.status
            ))));
        }
        reservation.status = status;
        reservation.updated_at = Utc::now();
        tracing::info!(reservation_id, status = %status, "reservation finished");
        Ok(reservation.clone())
    }

    pub fn get_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        lock::read(&self.state).get(reservation_id).cloned()
    }

    /// Every reservation, ordered by start time.
    pub fn list_reservations(&self) -> Vec<Reservation> {
        self.collect(|_| true)
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<Reservation> {
        self.collect(|r| r.user_id == user_id)
    }

    pub fn list_by_gpu(&self, gpu_id: &str) -> Vec<Reservation> {
        self.collect(|r| r.gpu_id == gpu_id)
    }

    fn collect(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut reservations = lock::read(&self.state)
            .reservations
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect::<Vec<_>>();
        reservations.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        reservations
    }

    /// Live reservations on `gpu_id` overlapping `[start, end]`.
    pub fn find_conflicts(
        &self,
        gpu_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Reservation> {
        lock::read(&self.state)
            .conflicts(gpu_id, start, end, None)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ReservationStats {
        let state = lock::read(&self.state);
        let mut stats = ReservationStats::default();
        for reservation in state.reservations.values() {
            stats.count(reservation.status);
        }
        stats
    }

    pub fn sweep(&self) -> SweepOutcome {
        self.sweep_at(Utc::now())
    }

    /// Expires reservations whose window has passed and activates pending
    /// ones whose window has started.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut state = lock::write(&self.state);
        let mut outcome = SweepOutcome::default();
        let mut due = PriorityQueue::new();

        for reservation in state.reservations.values_mut() {
            if !reservation.is_live() {
                continue;
            }
            if reservation.end_time <= now {
                reservation.status = ReservationStatus::Expired;
                reservation.updated_at = now;
                outcome.expired.push(reservation.id.clone());
            } else if reservation.status == ReservationStatus::Pending
                && reservation.start_time <= now
            {
                due.push(
                    reservation.id.clone(),
                    (Reverse(reservation.start_time), reservation.priority),
                );
            }
        }

        while let Some((reservation_id, _)) = due.pop() {
            if let Some(reservation) = state.reservations.get_mut(&reservation_id) {
                reservation.status = ReservationStatus::Active;
                reservation.updated_at = now;
            }
            outcome.activated.push(reservation_id);
        }

        if !outcome.is_empty() {
            tracing::info!(
                activated = ?outcome.activated,
                expired = ?outcome.expired,
                "reservation sweep changed statuses"
            );
        }
        outcome
    }

    /// Run the reservation sweep loop until cancelled
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    tracing::info!("reservation sweep shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn validate_duration(&self, duration: TimeDelta) -> Result<()> {
        if duration <= TimeDelta::zero() {
            return Err(report!(AllocationError::validation(
                "reservation duration must be positive"
            )));
        }
        if duration > self.config.max_reservation_duration {
            return Err(report!(AllocationError::validation(format!(
                "reservation duration {}s exceeds the maximum of {}s",
                duration.num_seconds(),
                self.config.max_reservation_duration.num_seconds()
            ))));
        }
        Ok(())
    }

    fn validate_window(
        &self,
        start_time: DateTime<Utc>,
        duration: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.validate_duration(duration)?;
        if start_time < now {
            return Err(report!(AllocationError::validation(format!(
                "start time {start_time} is in the past"
            ))));
        }
        Ok(())
    }

    fn check_caps(&self, state: &ReservationState, user_id: &str, gpu_id: &str) -> Result<()> {
        let per_user = state.live_count(|r| r.user_id == user_id);
        if per_user >= self.config.max_reservations_per_user {
            return Err(report!(AllocationError::limit(format!(
                "user {user_id} already holds {per_user} reservations"
            ))));
        }
        let per_gpu = state.live_count(|r| r.gpu_id == gpu_id);
        if per_gpu >= self.config.max_reservations_per_gpu {
            return Err(report!(AllocationError::limit(format!(
                "gpu {gpu_id} already has {per_gpu} reservations"
            ))));
        }
        Ok(())
    }

    fn check_conflicts(
        &self,
        state: &ReservationState,
        gpu_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sharing_enabled: bool,
        exclude: Option<&str>,
    ) -> Result<()> {
        let conflicting = state
            .conflicts(gpu_id, start, end, exclude)
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>();
        if conflicting.is_empty() {
            return Ok(());
        }

        let policy = self.config.conflict_policy;
        if policy.permits(sharing_enabled) {
            tracing::debug!(%policy, ?conflicting, "overlap accepted");
            return Ok(());
        }
        Err(report!(AllocationError::conflict(
            gpu_id,
            format!("overlaps {}", conflicting.join(", "))
        ))
        .attach_printable(format!("conflict policy: {policy}")))
    }
}

fn end_of_window(start_time: DateTime<Utc>, duration: TimeDelta) -> Result<DateTime<Utc>> {
    start_time.checked_add_signed(duration).ok_or_else(|| {
        report!(AllocationError::validation(format!(
            "reservation starting at {start_time} cannot last {}s",
            duration.num_seconds()
        )))
    })
}

fn validate_required(request: &ReservationRequest) -> Result<()> {
    let missing = [
        ("user_id", request.user_id.as_str()),
        ("workload_id", request.workload_id.as_str()),
        ("gpu_id", request.gpu_id.as_str()),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(report!(AllocationError::validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        ))))
    }
}
