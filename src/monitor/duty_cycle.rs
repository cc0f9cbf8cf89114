//! Duty-cycle control law: multiplicative feedback on the working rate,
//! split of each control period into a work slice and a sleep slice.

#![allow(missing_docs)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use std::time::Duration;

/// Lower bound for the working rate; the rate never collapses to zero.
pub const MIN_WORKING_RATE: f64 = 1e-3;

/// Default control period.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

/// Work/sleep split for one control period. `work + sleep` always equals the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DutySlice {
    pub work: Duration,
    pub sleep: Duration,
}

impl DutySlice {
    #[must_use]
    pub fn period(&self) -> Duration {
        self.work + self.sleep
    }

    /// Whether the members get stopped at all this period.
    #[must_use]
    pub fn suspends(&self) -> bool {
        !self.sleep.is_zero()
    }
}

/// Mutable state carried across iterations by exactly one limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    /// `None` until the first update seeds it with the limit.
    pub working_rate: Option<f64>,
    pub iteration: u64,
    pub slice: DutySlice,
}

impl ControlState {
    fn initial(period: Duration) -> Self {
        Self {
            working_rate: None,
            iteration: 0,
            slice: DutySlice {
                work: period,
                sleep: Duration::ZERO,
            },
        }
    }
}

/// Adaptive duty-cycle controller.
///
/// Each update scales the working rate by `limit / measured` so that a process
/// which overshot its budget at the previous rate gets proportionally less
/// work time next period, converging geometrically on the rate at which the
/// measured usage equals the limit.
#[derive(Debug, Clone)]
pub struct DutyCycleController {
    limit: f64,
    period: Duration,
    smoothing: Option<f64>,
    state: ControlState,
}

impl DutyCycleController {
    /// `limit` is a fraction of one core. It is capped at 1 but never raised;
    /// configured limits are validated against [`MIN_WORKING_RATE`] up front.
    #[must_use]
    pub fn new(limit: f64, period: Duration) -> Self {
        let limit = if limit.is_finite() && limit > 0.0 {
            limit.min(1.0)
        } else {
            1.0
        };
        Self {
            limit,
            period,
            smoothing: None,
            state: ControlState::initial(period),
        }
    }

    /// Blend each new rate with the previous one: `alpha * raw + (1 - alpha) * prev`.
    #[must_use]
    pub fn with_smoothing(mut self, alpha: Option<f64>) -> Self {
        self.smoothing = alpha.filter(|a| *a > 0.0 && *a < 1.0);
        self
    }

    #[must_use]
    pub fn limit(&self) -> f64 {
        self.limit
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub fn state(&self) -> &ControlState {
        &self.state
    }

    #[must_use]
    pub fn working_rate(&self) -> Option<f64> {
        self.state.working_rate
    }

    /// Compute the split for the next period from the usage measured over the
    /// previous one.
    ///
    /// An unknown aggregate (nothing measurable yet) seeds the rate with the
    /// limit. A zero aggregate saturates the rate at 1.
    pub fn update(&mut self, aggregate_usage: Option<f64>) -> DutySlice {
        let measured = aggregate_usage.filter(|usage| usage.is_finite() && *usage >= 0.0);

        let rate = match (measured, self.state.working_rate) {
            (Some(usage), Some(previous)) => {
                let raw = if usage > 0.0 {
                    (previous / usage * self.limit).min(1.0)
                } else {
                    1.0
                };
                let blended = match self.smoothing {
                    Some(alpha) => alpha.mul_add(raw, (1.0 - alpha) * previous),
                    None => raw,
                };
                if blended.is_finite() {
                    blended.clamp(MIN_WORKING_RATE, 1.0)
                } else {
                    1.0
                }
            }
            _ => self.limit,
        };

        self.state.working_rate = Some(rate);
        self.state.slice = split_period(self.period, rate);
        self.state.slice
    }

    /// Advance the iteration counter once a full period has been applied.
    pub fn finish_iteration(&mut self) {
        self.state.iteration = self.state.iteration.saturating_add(1);
    }

    /// Forget everything learned about the previous target.
    pub fn reset(&mut self) {
        self.state = ControlState::initial(self.period);
    }
}

/// Split `period` into `period * rate` of work and the remainder of sleep.
#[must_use]
pub fn split_period(period: Duration, rate: f64) -> DutySlice {
    let period_ns = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
    let rate = if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        1.0
    };
    let work_ns = ((period_ns as f64) * rate).round() as u64;
    let work = Duration::from_nanos(work_ns.min(period_ns));
    DutySlice {
        work,
        sleep: period.saturating_sub(work),
    }
}
