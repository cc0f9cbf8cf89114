//! Activity logger: a dedicated thread owns the [`JsonlWriter`]; limiter and
//! daemon threads hand it [`ActivityEvent`]s over a bounded crossbeam channel.
//!
//! `send()` uses `try_send()`, so a slow disk never stretches a control period.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{PdlError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::platform::pal::Pid;

// ──────────────────── channel capacity ────────────────────

const CHANNEL_CAPACITY: usize = 1024;

// ──────────────────── public event type ────────────────────

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
        roles: usize,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    LimiterStarted {
        role: String,
        target: String,
        limit_pct: f64,
        include_descendants: bool,
    },
    LimiterStopped {
        role: String,
        reason: String,
        iterations: u64,
    },
    TargetResolved {
        role: String,
        pid: Pid,
    },
    TargetChanged {
        role: String,
        from: Pid,
        to: Option<Pid>,
    },
    TargetLost {
        role: String,
        pid: Pid,
    },
    ProcessSetEmpty {
        role: String,
        pid: Pid,
    },
    MemberVanished {
        role: String,
        pid: Pid,
        signal: &'static str,
    },
    TimingDeviation {
        role: String,
        pid: Pid,
        delay: Duration,
    },
    DutyCycleSample {
        role: String,
        pid: Pid,
        members: usize,
        /// Aggregate usage as a fraction of one core, when known.
        usage: Option<f64>,
        working_rate: f64,
        work: Duration,
        sleep: Duration,
    },
    Error {
        role: Option<String>,
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

impl ActivityEvent {
    /// Build an `Error` event from a crate error.
    #[must_use]
    pub fn from_error(role: Option<&str>, error: &PdlError) -> Self {
        Self::Error {
            role: role.map(str::to_string),
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

// ──────────────────── public handle ────────────────────

/// Cheaply-cloneable handle for sending log events from any thread.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and counted.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Number of events dropped due to channel back-pressure.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// A handle with no logger thread behind it; every event is discarded.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

// ──────────────────── configuration ────────────────────

pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
    /// Also print a one-line summary of every event to stderr.
    pub echo_stderr: bool,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl_config: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
            echo_stderr: false,
        }
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle plus its join handle.
///
/// The thread runs until `handle.shutdown()` is called or every handle is dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let echo = config.echo_stderr;
    let join = thread::Builder::new()
        .name("pdl-logger".to_string())
        .spawn(move || {
            logger_thread_main(&rx, config.jsonl_config, echo, &dropped_clone);
        })
        .map_err(|e| PdlError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(
    rx: &Receiver<ActivityEvent>,
    jsonl_config: JsonlConfig,
    echo: bool,
    dropped: &AtomicU64,
) {
    let mut jsonl = JsonlWriter::open(jsonl_config);
    let mut write = |entry: &LogEntry| {
        if echo {
            eprintln!("[pdl] {}", entry.summary());
        }
        jsonl.write_entry(entry);
    };

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            write(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        if let Some(entry) = event_to_log_entry(&event) {
            write(&entry);
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let micros = |d: &Duration| u64::try_from(d.as_micros()).unwrap_or(u64::MAX);

    let entry = match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
            roles,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} roles={roles}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::LimiterStarted {
            role,
            target,
            limit_pct,
            include_descendants,
        } => {
            let mut e = LogEntry::new(EventType::LimiterStart, Severity::Info);
            e.role = Some(role.clone());
            e.limit_pct = Some(*limit_pct);
            e.details = Some(format!(
                "target={target} include_descendants={include_descendants}"
            ));
            e
        }
        ActivityEvent::LimiterStopped {
            role,
            reason,
            iterations,
        } => {
            let mut e = LogEntry::new(EventType::LimiterStop, Severity::Info);
            e.role = Some(role.clone());
            e.details = Some(format!("reason={reason} iterations={iterations}"));
            e
        }
        ActivityEvent::TargetResolved { role, pid } => {
            let mut e = LogEntry::new(EventType::TargetResolved, Severity::Info);
            e.role = Some(role.clone());
            e.pid = Some(*pid);
            e
        }
        ActivityEvent::TargetChanged { role, from, to } => {
            let mut e = LogEntry::new(EventType::TargetChanged, Severity::Info);
            e.role = Some(role.clone());
            e.pid = *to;
            e.details = Some(match to {
                Some(to) => format!("{from}->{to}"),
                None => format!("{from}->none"),
            });
            e
        }
        ActivityEvent::TargetLost { role, pid } => {
            let mut e = LogEntry::new(EventType::TargetLost, Severity::Warning);
            e.role = Some(role.clone());
            e.pid = Some(*pid);
            e
        }
        ActivityEvent::ProcessSetEmpty { role, pid } => {
            let mut e = LogEntry::new(EventType::ProcessSetEmpty, Severity::Info);
            e.role = Some(role.clone());
            e.pid = Some(*pid);
            e
        }
        ActivityEvent::MemberVanished { role, pid, signal } => {
            let mut e = LogEntry::new(EventType::MemberVanished, Severity::Info);
            e.role = Some(role.clone());
            e.pid = Some(*pid);
            e.signal = Some((*signal).to_string());
            e
        }
        ActivityEvent::TimingDeviation { role, pid, delay } => {
            let mut e = LogEntry::new(EventType::TimingDeviation, Severity::Warning);
            e.role = Some(role.clone());
            e.pid = Some(*pid);
            e.delay_us = Some(micros(delay));
            e
        }
        ActivityEvent::DutyCycleSample {
            role,
            pid,
            members,
            usage,
            working_rate,
            work,
            sleep,
        } => {
            let mut e = LogEntry::new(EventType::DutyCycle, Severity::Info);
            e.role = Some(role.clone());
            e.pid = Some(*pid);
            e.members = Some(*members);
            e.pcpu = usage.map(|u| u * 100.0);
            e.working_rate = Some(*working_rate);
            e.work_us = Some(micros(work));
            e.sleep_us = Some(micros(sleep));
            e
        }
        ActivityEvent::Error {
            role,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.role.clone_from(role);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path, channel_capacity: usize) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl_config: JsonlConfig {
                path: dir.join("test.jsonl"),
                fallback_path: None,
                max_bytes: 10 * 1024 * 1024,
                keep_rotated: 3,
                sync_every: Duration::from_secs(60),
            },
            channel_capacity,
            echo_stderr: false,
        }
    }

    fn lines(dir: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("test.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        handle.send(ActivityEvent::DaemonStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc".to_string(),
            roles: 2,
        });
        handle.shutdown();
        join.join().unwrap();

        let entries = lines(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["event"], "daemon_start");
    }

    #[test]
    fn limiter_events_carry_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        handle.send(ActivityEvent::TargetResolved {
            role: "nidps".to_string(),
            pid: 321,
        });
        handle.send(ActivityEvent::DutyCycleSample {
            role: "nidps".to_string(),
            pid: 321,
            members: 3,
            usage: Some(0.052),
            working_rate: 0.25,
            work: Duration::from_millis(25),
            sleep: Duration::from_millis(75),
        });
        handle.send(ActivityEvent::MemberVanished {
            role: "nidps".to_string(),
            pid: 322,
            signal: "SIGSTOP",
        });
        handle.send(ActivityEvent::TargetChanged {
            role: "nidps".to_string(),
            from: 321,
            to: None,
        });
        handle.shutdown();
        join.join().unwrap();

        let entries = lines(dir.path());
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["event"], "target_resolved");
        assert_eq!(entries[1]["event"], "duty_cycle");
        assert_eq!(entries[1]["work_us"], 25_000);
        assert_eq!(entries[1]["sleep_us"], 75_000);
        assert_eq!(entries[1]["members"], 3);
        assert!((entries[1]["pcpu"].as_f64().unwrap() - 5.2).abs() < 1e-9);
        assert_eq!(entries[2]["signal"], "SIGSTOP");
        assert_eq!(entries[3]["details"], "321->none");
    }

    #[test]
    fn errors_are_critical_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        let error = PdlError::Signal {
            pid: 9,
            signal: "SIGSTOP",
            details: "Operation not permitted".to_string(),
        };
        handle.send(ActivityEvent::from_error(Some("cli"), &error));
        handle.shutdown();
        join.join().unwrap();

        let entries = lines(dir.path());
        assert_eq!(entries[0]["severity"], "critical");
        assert_eq!(entries[0]["error_code"], "PDL-2002");
        assert_eq!(entries[0]["role"], "cli");
        assert_eq!(entries[0]["ok"], false);
    }

    #[test]
    fn handles_cloneable_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path(), 64)).unwrap();
        let h2 = handle.clone();
        thread::spawn(move || {
            h2.send(ActivityEvent::ProcessSetEmpty {
                role: "hidps".to_string(),
                pid: 77,
            });
        })
        .join()
        .unwrap();
        handle.send(ActivityEvent::TargetLost {
            role: "hidps".to_string(),
            pid: 77,
        });
        handle.shutdown();
        join.join().unwrap();
        assert_eq!(lines(dir.path()).len(), 2);
    }

    #[test]
    fn full_channel_counts_drops() {
        let (tx, _rx) = bounded(1);
        let handle = ActivityLoggerHandle {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..3 {
            handle.send(ActivityEvent::ProcessSetEmpty {
                role: "r".to_string(),
                pid: 1,
            });
        }
        assert_eq!(handle.dropped_events(), 2);
    }

    #[test]
    fn detached_handle_discards_silently() {
        let handle = ActivityLoggerHandle::detached();
        handle.send(ActivityEvent::TargetResolved {
            role: "r".to_string(),
            pid: 1,
        });
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }
}
