//! Daemon subsystem: per-role limiter loops, their supervisor, cancellation
//! and signal handling.

pub mod clock;
pub mod limiter;
#[cfg(feature = "daemon")]
pub mod loop_main;
#[cfg(all(feature = "daemon", unix))]
pub mod signals;
pub mod supervisor;
