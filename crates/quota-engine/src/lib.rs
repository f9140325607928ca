//! QuotaGuard Engine
//!
//! The quota decision and scheduling engine: sliding-window accounting,
//! the priority queue, offline pattern analysis, and the `Manager`
//! orchestrator that composes them behind three pipeline hooks
//! (pre-call, post-call, session-end).

pub mod config;
pub mod housekeeping;
pub mod manager;
pub mod pattern_detector;
pub mod queue;
pub mod window_tracker;

pub use config::GovernorConfig;
pub use manager::Manager;
pub use quotaguard_core::{CoreError, Result};
