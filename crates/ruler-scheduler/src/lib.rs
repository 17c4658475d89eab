//! Ruler Scheduler - Periodic evaluation of alert rules
//!
//! Drives one routine per rule from a shared tick clock and applies rule
//! group changes to the running set.

pub mod config;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use scheduler::Scheduler;
