//! Per-process CPU usage estimation: CPU-time deltas over wall-time deltas,
//! smoothed with an exponential moving average.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    cpu_time: Duration,
    start_ticks: u64,
    at: Instant,
}

/// Online usage estimator for a single process.
///
/// The estimate is `None` until two samples far enough apart exist.
#[derive(Debug, Clone)]
pub struct UsageEstimator {
    alpha: f64,
    min_interval: Duration,
    last: Option<Sample>,
    usage: Option<f64>,
}

impl UsageEstimator {
    #[must_use]
    pub fn new(alpha: f64, min_interval: Duration) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            min_interval,
            last: None,
            usage: None,
        }
    }

    /// Feed the cumulative CPU time observed at `observed_at`.
    ///
    /// `start_ticks` identifies the process incarnation; a change means the
    /// pid was reused and history is discarded.
    pub fn update(
        &mut self,
        cpu_time: Duration,
        start_ticks: u64,
        observed_at: Instant,
    ) -> Option<f64> {
        let current = Sample {
            cpu_time,
            start_ticks,
            at: observed_at,
        };

        let Some(previous) = self.last else {
            self.last = Some(current);
            return self.usage;
        };

        if previous.start_ticks != start_ticks || cpu_time < previous.cpu_time {
            self.last = Some(current);
            self.usage = None;
            return None;
        }

        let Some(wall) = observed_at.checked_duration_since(previous.at) else {
            // Clock went backwards; restart the interval.
            self.last = Some(current);
            return self.usage;
        };
        if wall < self.min_interval || wall.is_zero() {
            return self.usage;
        }

        let sample = (cpu_time - previous.cpu_time).as_secs_f64() / wall.as_secs_f64();
        self.usage = Some(match self.usage {
            None => sample,
            Some(prev) => ewma(self.alpha, prev, sample),
        });
        self.last = Some(current);
        self.usage
    }

    /// Latest estimate, `None` while unmeasurable.
    #[must_use]
    pub fn usage(&self) -> Option<f64> {
        self.usage
    }
}

#[inline]
fn ewma(alpha: f64, prev: f64, current: f64) -> f64 {
    alpha.mul_add(current, (1.0 - alpha) * prev)
}
