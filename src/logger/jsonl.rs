//! JSONL activity log: one JSON object per line, each line written with a
//! single `write_all`.
//!
//! When the configured file cannot be used the writer falls back to
//! `paths.jsonl_fallback`, then to stderr with a `[PDL-JSONL]` prefix, and
//! finally drops lines.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::config::PathsConfig;
use crate::core::errors::{PdlError, Result};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Log event types of the limiter activity model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LimiterStart,
    LimiterStop,
    TargetResolved,
    TargetChanged,
    TargetLost,
    ProcessSetEmpty,
    MemberVanished,
    TimingDeviation,
    DutyCycle,
    DaemonStart,
    DaemonStop,
    Error,
}

/// A single JSONL log entry. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Role name of the limiter that emitted the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Target or member pid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Aggregate CPU usage in percent of one core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcpu: Option<f64>,
    /// Configured limit in percent of one core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_us: Option<u64>,
    /// Overshoot of a sleep beyond its requested length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_us: Option<u64>,
    /// Number of processes in the controlled set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<usize>,
    /// Signal that observed the event (`SIGSTOP`/`SIGCONT`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// PDL error code if something failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Freeform details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            role: None,
            pid: None,
            pcpu: None,
            limit_pct: None,
            working_rate: None,
            work_us: None,
            sleep_us: None,
            delay_us: None,
            members: None,
            signal: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    /// Human-readable one-line rendering for the verbose stderr echo.
    #[must_use]
    pub fn summary(&self) -> String {
        let event = serde_json::to_value(&self.event)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        let mut line = event;
        if let Some(role) = &self.role {
            line.push_str(&format!(" role={role}"));
        }
        if let Some(pid) = self.pid {
            line.push_str(&format!(" pid={pid}"));
        }
        if let Some(pcpu) = self.pcpu {
            line.push_str(&format!(" %cpu={pcpu:.2}"));
        }
        if let Some(rate) = self.working_rate {
            line.push_str(&format!(" rate={rate:.4}"));
        }
        if let (Some(work), Some(sleep)) = (self.work_us, self.sleep_us) {
            line.push_str(&format!(" work={work}us sleep={sleep}us"));
        }
        if let Some(delay) = self.delay_us {
            line.push_str(&format!(" delay={delay}us"));
        }
        if let Some(code) = &self.error_code {
            line.push_str(&format!(" [{code}]"));
        }
        if let Some(message) = &self.error_message {
            line.push_str(&format!(" {message}"));
        }
        if let Some(details) = &self.details {
            line.push_str(&format!(" {details}"));
        }
        line
    }
}

/// Settings for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when `path` cannot be opened or written, usually RAM-backed.
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the active file would grow past this size.
    pub max_bytes: u64,
    /// Rotated generations kept next to the active file (`.1` is the newest).
    pub keep_rotated: u32,
    pub sync_every: Duration,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self::from_paths(&PathsConfig::default())
    }
}

impl JsonlConfig {
    /// Writer settings for the configured log locations.
    #[must_use]
    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            path: paths.jsonl_log.clone(),
            fallback_path: paths.jsonl_fallback.clone(),
            max_bytes: 32 * 1024 * 1024,
            keep_rotated: 5,
            sync_every: Duration::from_secs(10),
        }
    }
}

const BUF_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Primary,
    Fallback,
}

/// Where lines currently go; each failure moves one step down.
enum Sink {
    File {
        tier: Tier,
        out: BufWriter<File>,
        len: u64,
    },
    Stderr,
    Discard,
}

/// Append-only JSONL writer with size rotation and a fallback chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Never fails: an unusable path only moves the writer down the chain.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let sink = open_sink(&config, Tier::Primary);
        Self {
            config,
            sink,
            last_sync: Instant::now(),
        }
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(e) => eprintln!("[PDL-JSONL] cannot serialize {:?} entry: {e}", entry.event),
        }
    }

    pub fn flush(&mut self) {
        if let Sink::File { out, .. } = &mut self.sink {
            let _ = out.flush();
        }
    }

    /// Flush and `fdatasync` the active file.
    pub fn fsync(&mut self) {
        if let Sink::File { out, .. } = &mut self.sink {
            let _ = out.flush();
            let _ = out.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    /// `primary`, `fallback`, `stderr` or `discard`.
    #[must_use]
    pub fn state(&self) -> &'static str {
        match &self.sink {
            Sink::File {
                tier: Tier::Primary,
                ..
            } => "primary",
            Sink::File {
                tier: Tier::Fallback,
                ..
            } => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Size of the active file, including what was there before opening.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        match &self.sink {
            Sink::File { len, .. } => *len,
            Sink::Stderr | Sink::Discard => 0,
        }
    }

    // ──────────────────────── internals ────────────────────────

    fn write_line(&mut self, line: &str) {
        let size = line.len() as u64;
        loop {
            match &mut self.sink {
                Sink::File { tier, out, len } => {
                    let tier = *tier;
                    if *len > 0 && *len + size > self.config.max_bytes {
                        self.rotate(tier);
                        continue;
                    }
                    if out.write_all(line.as_bytes()).is_ok() {
                        *len += size;
                        break;
                    }
                    eprintln!("[PDL-JSONL] write to {tier:?} log failed");
                    self.sink = self.below(tier);
                }
                Sink::Stderr => {
                    if write!(io::stderr(), "[PDL-JSONL] {line}").is_err() {
                        self.sink = Sink::Discard;
                    }
                    break;
                }
                Sink::Discard => break,
            }
        }

        if self.last_sync.elapsed() >= self.config.sync_every {
            self.fsync();
        }
    }

    fn below(&self, tier: Tier) -> Sink {
        match tier {
            Tier::Primary => open_sink(&self.config, Tier::Fallback),
            Tier::Fallback => Sink::Stderr,
        }
    }

    fn rotate(&mut self, tier: Tier) {
        self.flush();
        // The handle must be closed before the file is renamed away.
        self.sink = Sink::Discard;

        let base = match tier {
            Tier::Primary => self.config.path.clone(),
            Tier::Fallback => match &self.config.fallback_path {
                Some(path) => path.clone(),
                None => {
                    self.sink = Sink::Stderr;
                    return;
                }
            },
        };
        shift_generations(&base, self.config.keep_rotated);

        self.sink = match open_append(&base) {
            Ok((file, _)) => Sink::File {
                tier,
                out: BufWriter::with_capacity(BUF_CAPACITY, file),
                len: 0,
            },
            Err(e) => {
                eprintln!("[PDL-JSONL] reopen after rotation failed: {e}");
                self.below(tier)
            }
        };
    }
}

// ──────────────────────── helpers ────────────────────────

fn open_sink(config: &JsonlConfig, tier: Tier) -> Sink {
    let path = match tier {
        Tier::Primary => &config.path,
        Tier::Fallback => match &config.fallback_path {
            Some(path) => path,
            None => {
                eprintln!("[PDL-JSONL] no fallback log configured, writing to stderr");
                return Sink::Stderr;
            }
        },
    };

    match open_append(path) {
        Ok((file, len)) => {
            if tier == Tier::Fallback {
                eprintln!("[PDL-JSONL] using fallback log {}", path.display());
            }
            Sink::File {
                tier,
                out: BufWriter::with_capacity(BUF_CAPACITY, file),
                len,
            }
        }
        Err(e) => {
            eprintln!("[PDL-JSONL] {e}");
            match tier {
                Tier::Primary => open_sink(config, Tier::Fallback),
                Tier::Fallback => Sink::Stderr,
            }
        }
    }
}

/// Open for appending, creating parent directories. Returns the current size.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PdlError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| PdlError::io(path, source))?;
    let len = file.metadata().map_or(0, |meta| meta.len());
    Ok((file, len))
}

/// `log.jsonl.{keep}` is dropped, `.N` becomes `.N+1` and the active file `.1`.
fn shift_generations(base: &Path, keep: u32) {
    if keep == 0 {
        let _ = fs::remove_file(base);
        return;
    }
    let _ = fs::remove_file(generation(base, keep));
    for index in (1..keep).rev() {
        let _ = fs::rename(generation(base, index), generation(base, index + 1));
    }
    let _ = fs::rename(base, generation(base, 1));
}

fn generation(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────────── tests ────────────────────────
