//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use process_duty_limiter::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, RoleConfig, TargetSpec};
pub use crate::core::errors::{PdlError, Result};

// Platform
pub use crate::platform::pal::{Pid, ProcessPlatform, SignalKind, detect_platform};

// Monitor
pub use crate::monitor::duty_cycle::{DutyCycleController, DutySlice};
pub use crate::monitor::process_set::{ProcessSetSnapshot, ProcessSetTracker, ProcessTracker};

// Target
pub use crate::target::{RoleRegistry, TargetProvider, provider_for};

// Daemon
pub use crate::daemon::clock::{CancelToken, Clock, SystemClock};
pub use crate::daemon::limiter::{Limiter, LimiterExit, LimiterSettings};
pub use crate::daemon::supervisor::Supervisor;
