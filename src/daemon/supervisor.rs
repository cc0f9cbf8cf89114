//! Limiter supervisor: one named OS thread per role, all sharing one
//! cancellation token and one activity logger.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::config::TrackerConfig;
use crate::core::errors::{PdlError, Result};
use crate::daemon::clock::{CancelToken, SystemClock, Wake};
use crate::daemon::limiter::{Limiter, LimiterExit, LimiterSettings};
use crate::logger::activity::ActivityLoggerHandle;
use crate::monitor::process_set::ProcessSetTracker;
use crate::platform::pal::ProcessPlatform;
use crate::target::TargetProvider;

/// Poll interval of [`Supervisor::wait`] for finished limiters.
const WAIT_POLL: Duration = Duration::from_millis(200);

struct RoleWorker {
    role: String,
    join: thread::JoinHandle<LimiterExit>,
}

pub struct Supervisor {
    platform: Arc<dyn ProcessPlatform>,
    tracker_config: TrackerConfig,
    logger: ActivityLoggerHandle,
    cancel: CancelToken,
    workers: Vec<RoleWorker>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        platform: Arc<dyn ProcessPlatform>,
        tracker_config: TrackerConfig,
        logger: ActivityLoggerHandle,
        cancel: CancelToken,
    ) -> Self {
        Self {
            platform,
            tracker_config,
            logger,
            cancel,
            workers: Vec::new(),
        }
    }

    /// Start a limiter for one role on its own `pdl-<role>` thread.
    ///
    /// Failing to create the thread is the only error; everything the limiter
    /// meets afterwards is handled inside its loop.
    pub fn spawn(
        &mut self,
        settings: LimiterSettings,
        provider: Box<dyn TargetProvider>,
    ) -> Result<()> {
        let role = settings.role.clone();
        let tracker = ProcessSetTracker::new(Arc::clone(&self.platform), &self.tracker_config);
        let clock = SystemClock::new(self.cancel.clone());
        let logger = self.logger.clone();

        let join = thread::Builder::new()
            .name(format!("pdl-{role}"))
            .spawn(move || Limiter::new(settings, tracker, provider, clock, logger).run())
            .map_err(|e| PdlError::Spawn {
                role: role.clone(),
                details: e.to_string(),
            })?;

        self.workers.push(RoleWorker { role, join });
        Ok(())
    }

    #[must_use]
    pub fn roles(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.role.as_str()).collect()
    }

    /// Number of limiters still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.workers.iter().filter(|w| !w.join.is_finished()).count()
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block until cancellation or until every limiter has returned on its own.
    pub fn wait(&self) {
        while self.active() > 0 {
            if self.cancel.sleep(WAIT_POLL) == Wake::Cancelled {
                return;
            }
        }
    }

    /// Cancel every limiter and collect how each one ended.
    ///
    /// Limiters resume what they stopped before their threads exit.
    pub fn shutdown(self) -> Vec<(String, LimiterExit)> {
        self.cancel.cancel();
        self.join()
    }

    /// Wait for every limiter thread without cancelling.
    pub fn join(self) -> Vec<(String, LimiterExit)> {
        let mut exits = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            match worker.join.join() {
                Ok(exit) => exits.push((worker.role, exit)),
                Err(_) => eprintln!("[PDL-SUPERVISOR] limiter thread for {} panicked", worker.role),
            }
        }
        exits
    }
}
