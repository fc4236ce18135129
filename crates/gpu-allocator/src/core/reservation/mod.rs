//! Time-windowed GPU reservations.

mod manager;
mod types;

pub use manager::ReservationManager;
pub use types::{
    ConflictPolicy, Reservation, ReservationConfig, ReservationPatch, ReservationRequest,
    ReservationStats, SweepOutcome,
};
