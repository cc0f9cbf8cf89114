//! Process monitoring: per-process CPU usage estimation, process set tracking
//! and the duty-cycle control law.

pub mod duty_cycle;
pub mod process_set;
pub mod usage;
