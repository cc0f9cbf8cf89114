//! Per-target duty-cycle limiter loop.
//!
//! One `Limiter` owns one target. Each [`Limiter::step`] resolves the target,
//! refreshes its process set, recomputes the work/sleep split and then lets
//! the set run for the work slice and keeps it stopped for the sleep slice.
//! Nothing inside a step is fatal: vanished processes, refresh failures and
//! refused signals are logged and the loop carries on.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::time::Duration;

use crate::core::config::{LimiterConfig, RoleConfig};
use crate::daemon::clock::{Clock, Wake};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::duty_cycle::{DutyCycleController, DutySlice};
use crate::monitor::process_set::{ProcessSetSnapshot, ProcessTracker};
use crate::platform::pal::{Delivery, Pid, SignalKind};
use crate::target::TargetProvider;

// ──────────────────── settings ────────────────────

/// Everything one limiter needs to know about its role.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterSettings {
    pub role: String,
    /// Fraction of one core, in `(0, 1]`.
    pub limit: f64,
    pub include_descendants: bool,
    /// Stop instead of waiting when the target is missing.
    pub exit_when_absent: bool,
    pub period: Duration,
    pub resolve_backoff: Duration,
    pub idle_interval: Duration,
    /// Re-poll the target provider every this many iterations.
    pub repoll_every: u64,
    pub timing_tolerance: Duration,
    pub report_every: u64,
    pub rate_smoothing: Option<f64>,
    /// Emit a duty-cycle sample every `report_every` iterations.
    pub verbose: bool,
}

impl LimiterSettings {
    /// Settings with the default loop timings.
    #[must_use]
    pub fn new(role: impl Into<String>, limit: f64) -> Self {
        Self::with_loop(&LimiterConfig::default(), role, limit)
    }

    #[must_use]
    pub fn from_config(limiter: &LimiterConfig, role: &RoleConfig) -> Self {
        let mut settings = Self::with_loop(limiter, role.name.clone(), role.limit_fraction());
        settings.include_descendants = role.include_descendants;
        settings.exit_when_absent = role.exit_when_absent;
        settings
    }

    fn with_loop(limiter: &LimiterConfig, role: impl Into<String>, limit: f64) -> Self {
        Self {
            role: role.into(),
            limit,
            include_descendants: false,
            exit_when_absent: false,
            period: Duration::from_millis(limiter.period_ms),
            resolve_backoff: Duration::from_millis(limiter.resolve_backoff_ms),
            idle_interval: Duration::from_millis(limiter.idle_interval_ms),
            repoll_every: limiter.repoll_every.max(1),
            timing_tolerance: Duration::from_millis(limiter.timing_tolerance_ms),
            report_every: limiter.report_every.max(1),
            rate_smoothing: limiter.rate_smoothing,
            verbose: false,
        }
    }
}

// ──────────────────── outcomes ────────────────────

/// What one completed control iteration did.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: u64,
    pub target: Pid,
    /// Members still present after both signal passes.
    pub members: Vec<Pid>,
    pub aggregate_usage: Option<f64>,
    pub working_rate: f64,
    pub slice: DutySlice,
    /// Members that turned out to be gone when signalled.
    pub vanished: Vec<Pid>,
    /// Work-slice overshoot above the tolerance.
    pub timing_deviation: Option<Duration>,
}

/// Result of a single [`Limiter::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Controlled(IterationReport),
    /// No target known; the resolve backoff was slept.
    TargetUnresolved,
    /// A re-poll disagreed with the held target; all state for it was dropped.
    TargetChanged { from: Pid, to: Option<Pid> },
    /// The target has no live processes; the idle interval was slept.
    EmptyProcessSet { target: Pid },
    /// Target missing while `exit_when_absent` is set.
    TargetGone,
    Cancelled,
}

/// Why [`Limiter::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterExit {
    Cancelled,
    TargetGone,
}

impl LimiterExit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::TargetGone => "target_gone",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub iterations: u64,
    pub unresolved_polls: u64,
    pub empty_sets: u64,
    pub target_changes: u64,
    pub vanished_members: u64,
    pub signal_errors: u64,
    pub timing_deviations: u64,
}

// ──────────────────── limiter ────────────────────

pub struct Limiter<T: ProcessTracker, P: TargetProvider, C: Clock> {
    settings: LimiterSettings,
    tracker: T,
    provider: P,
    clock: C,
    logger: ActivityLoggerHandle,
    controller: DutyCycleController,
    target: Option<Pid>,
    since_poll: u64,
    /// Pids left stopped by the last suspend pass.
    suspended: BTreeSet<Pid>,
    reported_empty: bool,
    stats: LimiterStats,
}

impl<T: ProcessTracker, P: TargetProvider, C: Clock> Limiter<T, P, C> {
    pub fn new(
        settings: LimiterSettings,
        tracker: T,
        provider: P,
        clock: C,
        logger: ActivityLoggerHandle,
    ) -> Self {
        let controller = DutyCycleController::new(settings.limit, settings.period)
            .with_smoothing(settings.rate_smoothing);
        Self {
            settings,
            tracker,
            provider,
            clock,
            logger,
            controller,
            target: None,
            since_poll: 0,
            suspended: BTreeSet::new(),
            reported_empty: false,
            stats: LimiterStats::default(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    #[must_use]
    pub fn target(&self) -> Option<Pid> {
        self.target
    }

    #[must_use]
    pub fn controller(&self) -> &DutyCycleController {
        &self.controller
    }

    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        self.stats
    }

    /// Pids currently left in the stopped state by this limiter.
    pub fn suspended(&self) -> impl Iterator<Item = Pid> + '_ {
        self.suspended.iter().copied()
    }

    /// Run until cancelled or, in lazy mode, until the target disappears.
    /// Every pid this limiter stopped is resumed before returning.
    pub fn run(&mut self) -> LimiterExit {
        self.logger.send(ActivityEvent::LimiterStarted {
            role: self.settings.role.clone(),
            target: self.provider.describe(),
            limit_pct: self.settings.limit * 100.0,
            include_descendants: self.settings.include_descendants,
        });

        let exit = loop {
            match self.step() {
                StepOutcome::Cancelled => break LimiterExit::Cancelled,
                StepOutcome::TargetGone => break LimiterExit::TargetGone,
                _ => {}
            }
        };

        self.release_suspended();
        self.logger.send(ActivityEvent::LimiterStopped {
            role: self.settings.role.clone(),
            reason: exit.as_str().to_string(),
            iterations: self.stats.iterations,
        });
        exit
    }

    /// Execute one iteration of the control loop.
    pub fn step(&mut self) -> StepOutcome {
        let target = match self.resolve() {
            Ok(pid) => pid,
            Err(outcome) => return outcome,
        };

        let now = self.clock.now();
        let mut snapshot = match self
            .tracker
            .refresh(target, self.settings.include_descendants, now)
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.logger
                    .send(ActivityEvent::from_error(Some(self.settings.role.as_str()), &e));
                ProcessSetSnapshot::empty(target)
            }
        };
        self.release_departed(&snapshot);

        if snapshot.is_empty() {
            self.stats.empty_sets += 1;
            if !self.reported_empty {
                self.reported_empty = true;
                self.logger.send(ActivityEvent::ProcessSetEmpty {
                    role: self.settings.role.clone(),
                    pid: target,
                });
            }
            if self.settings.exit_when_absent {
                return StepOutcome::TargetGone;
            }
            return match self.clock.sleep(self.settings.idle_interval) {
                Wake::Cancelled => StepOutcome::Cancelled,
                Wake::Elapsed => StepOutcome::EmptyProcessSet { target },
            };
        }
        self.reported_empty = false;

        let aggregate_usage = snapshot.aggregate_usage();
        let slice = self.controller.update(aggregate_usage);
        let working_rate = self.controller.working_rate().unwrap_or(self.settings.limit);
        let iteration = self.controller.state().iteration;

        let mut vanished = Vec::new();
        self.signal_all(&mut snapshot, SignalKind::Continue, &mut vanished);

        let started = self.clock.now();
        if self.clock.sleep(slice.work) == Wake::Cancelled {
            return StepOutcome::Cancelled;
        }
        let delay = self
            .clock
            .now()
            .saturating_duration_since(started)
            .saturating_sub(slice.work);
        let timing_deviation =
            (iteration > 0 && delay > self.settings.timing_tolerance).then_some(delay);
        if let Some(delay) = timing_deviation {
            self.stats.timing_deviations += 1;
            self.logger.send(ActivityEvent::TimingDeviation {
                role: self.settings.role.clone(),
                pid: target,
                delay,
            });
        }

        if slice.suspends() {
            self.signal_all(&mut snapshot, SignalKind::Stop, &mut vanished);
            if self.clock.sleep(slice.sleep) == Wake::Cancelled {
                self.release_suspended();
                return StepOutcome::Cancelled;
            }
        }

        if self.settings.verbose && iteration > 0 && iteration % self.settings.report_every == 0 {
            self.logger.send(ActivityEvent::DutyCycleSample {
                role: self.settings.role.clone(),
                pid: target,
                members: snapshot.len(),
                usage: aggregate_usage,
                working_rate,
                work: slice.work,
                sleep: slice.sleep,
            });
        }

        self.controller.finish_iteration();
        self.stats.iterations += 1;

        StepOutcome::Controlled(IterationReport {
            iteration,
            target,
            members: snapshot.pids().collect(),
            aggregate_usage,
            working_rate,
            slice,
            vanished,
            timing_deviation,
        })
    }

    // ──────────────────── internals ────────────────────

    /// Held or freshly polled target, or the outcome that ends this step.
    fn resolve(&mut self) -> Result<Pid, StepOutcome> {
        if let Some(held) = self.target {
            self.since_poll += 1;
            if self.since_poll < self.settings.repoll_every {
                return Ok(held);
            }
            self.since_poll = 0;
            let current = self.poll_provider();
            if current == Some(held) {
                return Ok(held);
            }

            self.drop_target();
            self.stats.target_changes += 1;
            let role = self.settings.role.clone();
            self.logger.send(match current {
                Some(to) => ActivityEvent::TargetChanged {
                    role,
                    from: held,
                    to: Some(to),
                },
                None => ActivityEvent::TargetLost { role, pid: held },
            });
            return Err(StepOutcome::TargetChanged {
                from: held,
                to: current,
            });
        }

        if let Some(pid) = self.poll_provider() {
            self.target = Some(pid);
            self.since_poll = 0;
            self.logger.send(ActivityEvent::TargetResolved {
                role: self.settings.role.clone(),
                pid,
            });
            return Ok(pid);
        }

        self.stats.unresolved_polls += 1;
        if self.settings.exit_when_absent {
            return Err(StepOutcome::TargetGone);
        }
        Err(match self.clock.sleep(self.settings.resolve_backoff) {
            Wake::Cancelled => StepOutcome::Cancelled,
            Wake::Elapsed => StepOutcome::TargetUnresolved,
        })
    }

    /// Provider answer, with this process treated as no target at all.
    fn poll_provider(&self) -> Option<Pid> {
        self.provider
            .current_target()
            .filter(|&pid| pid != std::process::id())
    }

    /// Signal every member; members that are gone or refuse the signal leave
    /// the snapshot for the rest of the iteration.
    fn signal_all(
        &mut self,
        snapshot: &mut ProcessSetSnapshot,
        kind: SignalKind,
        vanished: &mut Vec<Pid>,
    ) {
        let pids: Vec<Pid> = snapshot.pids().collect();
        for pid in pids {
            match self.tracker.signal(pid, kind) {
                Ok(Delivery::Delivered) => match kind {
                    SignalKind::Stop => {
                        self.suspended.insert(pid);
                    }
                    SignalKind::Continue => {
                        self.suspended.remove(&pid);
                    }
                },
                Ok(Delivery::NotFound) => {
                    self.suspended.remove(&pid);
                    snapshot.remove(pid);
                    self.tracker.remove(pid);
                    self.stats.vanished_members += 1;
                    vanished.push(pid);
                    self.logger.send(ActivityEvent::MemberVanished {
                        role: self.settings.role.clone(),
                        pid,
                        signal: kind.name(),
                    });
                }
                Err(e) => {
                    snapshot.remove(pid);
                    self.stats.signal_errors += 1;
                    self.logger
                        .send(ActivityEvent::from_error(Some(self.settings.role.as_str()), &e));
                }
            }
        }
    }

    /// Resume and forget stopped pids that fell out of the process set.
    fn release_departed(&mut self, snapshot: &ProcessSetSnapshot) {
        let departed: Vec<Pid> = self
            .suspended
            .iter()
            .copied()
            .filter(|pid| !snapshot.contains(*pid))
            .collect();
        for pid in departed {
            self.suspended.remove(&pid);
            self.resume(pid);
        }
    }

    fn release_suspended(&mut self) {
        for pid in std::mem::take(&mut self.suspended) {
            self.resume(pid);
        }
    }

    fn resume(&self, pid: Pid) {
        if let Err(e) = self.tracker.signal(pid, SignalKind::Continue) {
            self.logger
                .send(ActivityEvent::from_error(Some(self.settings.role.as_str()), &e));
        }
    }

    fn drop_target(&mut self) {
        self.release_suspended();
        self.tracker.reset();
        self.controller.reset();
        self.target = None;
        self.since_poll = 0;
        self.reported_empty = false;
    }
}

impl<T: ProcessTracker, P: TargetProvider, C: Clock> Drop for Limiter<T, P, C> {
    fn drop(&mut self) {
        self.release_suspended();
    }
}

// ──────────────────── tests ────────────────────
