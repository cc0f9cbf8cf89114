//! Daemon orchestration: logger thread, signal bridge and one limiter thread
//! per configured role.
//!
//! Threads:
//! - **Main thread**: spawns limiters, waits for shutdown, joins everything
//! - **Limiter threads** (`pdl-<role>`): one duty-cycle loop each
//! - **Logger thread** (`pdl-logger`): writes JSONL activity
//! - **Signal thread** (`pdl-signals`): turns SIGTERM/SIGINT into cancellation

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::clock::CancelToken;
use crate::daemon::limiter::{LimiterExit, LimiterSettings};
#[cfg(unix)]
use crate::daemon::signals::SignalHandler;
use crate::daemon::supervisor::Supervisor;
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::logger::jsonl::JsonlConfig;
use crate::platform::pal::{ProcessPlatform, detect_platform};
use crate::target::provider_for;

/// Runtime options that do not live in the config file.
#[derive(Debug, Clone)]
pub struct DaemonArgs {
    /// Echo activity to stderr and emit periodic duty-cycle samples.
    pub verbose: bool,
    /// Install SIGTERM/SIGINT handlers.
    pub handle_signals: bool,
}

impl Default for DaemonArgs {
    fn default() -> Self {
        Self {
            verbose: false,
            handle_signals: true,
        }
    }
}

pub struct LimiterDaemon {
    config: Config,
    args: DaemonArgs,
    platform: Arc<dyn ProcessPlatform>,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    #[cfg(unix)]
    signal_handler: Option<SignalHandler>,
    cancel: CancelToken,
    start_time: Instant,
}

impl LimiterDaemon {
    /// Build the daemon on the detected process platform.
    pub fn init(config: Config, args: DaemonArgs) -> Result<Self> {
        let platform = detect_platform()?;
        Self::with_platform(config, args, platform)
    }

    pub fn with_platform(
        config: Config,
        args: DaemonArgs,
        platform: Arc<dyn ProcessPlatform>,
    ) -> Result<Self> {
        config.validate()?;

        let (logger_handle, logger_join) = spawn_logger(ActivityLoggerConfig {
            jsonl_config: JsonlConfig::from_paths(&config.paths),
            echo_stderr: args.verbose,
            ..ActivityLoggerConfig::default()
        })?;

        let cancel = CancelToken::new();
        #[cfg(unix)]
        let signal_handler = if args.handle_signals {
            Some(SignalHandler::install(cancel.clone())?)
        } else {
            None
        };

        Ok(Self {
            config,
            args,
            platform,
            logger_handle,
            logger_join: Some(logger_join),
            #[cfg(unix)]
            signal_handler,
            cancel,
            start_time: Instant::now(),
        })
    }

    /// Token that stops every limiter when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run every configured role until shutdown is requested or, when all of
    /// them are lazy, until every target is gone.
    pub fn run(&mut self) -> Result<Vec<(String, LimiterExit)>> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.logger_handle.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
            roles: self.config.roles.len(),
        });

        let mut supervisor = Supervisor::new(
            Arc::clone(&self.platform),
            self.config.tracker.clone(),
            self.logger_handle.clone(),
            self.cancel.clone(),
        );
        for role in &self.config.roles {
            let mut settings = LimiterSettings::from_config(&self.config.limiter, role);
            settings.verbose = self.args.verbose;
            let provider = provider_for(&role.target, &role.name, &self.platform);
            if let Err(e) = supervisor.spawn(settings, provider) {
                self.logger_handle
                    .send(ActivityEvent::from_error(Some(role.name.as_str()), &e));
                supervisor.shutdown();
                self.finish("spawn failure");
                return Err(e);
            }
        }

        supervisor.wait();
        let reason = if self.cancel.is_cancelled() {
            "shutdown requested"
        } else {
            "all targets gone"
        };
        let exits = supervisor.shutdown();
        self.finish(reason);
        Ok(exits)
    }

    fn finish(&mut self, reason: &str) {
        let uptime_secs = self.start_time.elapsed().as_secs();
        self.logger_handle.send(ActivityEvent::DaemonStopped {
            reason: reason.to_string(),
            uptime_secs,
        });

        self.logger_handle.shutdown();
        if let Some(logger_join) = self.logger_join.take() {
            let _ = logger_join.join();
        }
        #[cfg(unix)]
        drop(self.signal_handler.take());

        let dropped = self.logger_handle.dropped_events();
        if dropped > 0 {
            eprintln!("[PDL-DAEMON] {dropped} activity events dropped");
        }
        if self.args.verbose {
            eprintln!("[PDL-DAEMON] shutdown complete (uptime={uptime_secs}s, reason={reason})");
        }
    }
}
