#![forbid(unsafe_code)]

//! Process Duty Limiter (pdl) keeps a process tree under a CPU budget by
//! duty-cycling it with SIGSTOP/SIGCONT.
//!
//! Two cooperating pieces per limited role:
//! 1. **Process set tracker**: resolves the target and its descendants and
//!    estimates each member's recent CPU usage
//! 2. **Duty-cycle controller**: turns aggregate usage into a work/sleep split
//!    of a fixed control period
//!
//! # Library usage
//!
//! ```rust,no_run
//! use process_duty_limiter::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use process_duty_limiter::core::config::Config;
//! use process_duty_limiter::monitor::duty_cycle::DutyCycleController;
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod platform;
pub mod target;
