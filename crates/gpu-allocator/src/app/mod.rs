//! Application module
//!
//! Wires the allocation core to discovery, isolation and the background
//! loops of the daemon.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::{AllocationService, ApplicationServices};
