//! Fractional GPU allocation for multi-tenant accelerator nodes.

pub mod app;
pub mod config;
pub mod core;
pub mod platform;
pub(crate) mod util;
