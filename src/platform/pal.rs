//! PAL trait and platform-specific implementations: process table reads and
//! stop/continue signal delivery.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{PdlError, Result};

/// Operating-system process identifier.
pub type Pid = u32;

/// The two signals a limiter ever sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Stop,
    Continue,
}

impl SignalKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stop => "SIGSTOP",
            Self::Continue => "SIGCONT",
        }
    }
}

/// Result of a signal delivery attempt that did not hit an OS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The process no longer exists.
    NotFound,
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStat {
    pub pid: Pid,
    pub ppid: Pid,
    pub comm: String,
    /// Single-letter scheduler state (`R`, `S`, `T`, `Z`, ...).
    pub state: char,
    /// User + system CPU time consumed so far.
    pub cpu_time: Duration,
    /// Start time in clock ticks after boot; changes when a pid is reused.
    pub start_ticks: u64,
}

impl ProcessStat {
    /// Zombie and dead entries cannot run and are not worth signalling.
    #[must_use]
    pub fn is_defunct(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// OS abstraction used by the process set tracker.
pub trait ProcessPlatform: Send + Sync {
    /// Snapshot of every process currently visible.
    fn processes(&self) -> Result<Vec<ProcessStat>>;
    /// Stats for one process, `None` if it does not exist.
    fn process(&self, pid: Pid) -> Result<Option<ProcessStat>>;
    /// Deliver a stop/continue signal. Idempotent.
    fn signal(&self, pid: Pid, kind: SignalKind) -> Result<Delivery>;
}

// ──────────────────── Linux ────────────────────

/// Linux platform implementation using `/proc/<pid>/stat` + `kill(2)`.
#[derive(Debug)]
pub struct LinuxPlatform {
    proc_root: PathBuf,
    ticks_per_second: u64,
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Read the process table from a different mount (tests, containers).
    #[must_use]
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            ticks_per_second: clock_ticks_per_second(),
        }
    }

    fn read_stat(&self, pid: Pid) -> Result<Option<ProcessStat>> {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        match fs::read_to_string(&path) {
            Ok(raw) => parse_proc_stat(pid, &raw, self.ticks_per_second).map(Some),
            // ESRCH shows up when the process exits between readdir and open.
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    || err.raw_os_error() == Some(3) =>
            {
                Ok(None)
            }
            Err(source) => Err(PdlError::io(path, source)),
        }
    }
}

impl ProcessPlatform for LinuxPlatform {
    fn processes(&self) -> Result<Vec<ProcessStat>> {
        let entries =
            fs::read_dir(&self.proc_root).map_err(|source| PdlError::io(&self.proc_root, source))?;

        let mut stats = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<Pid>().ok())
            else {
                continue;
            };
            // Processes exit while we walk; a vanished or unreadable entry is skipped.
            if let Ok(Some(stat)) = self.read_stat(pid) {
                stats.push(stat);
            }
        }
        Ok(stats)
    }

    fn process(&self, pid: Pid) -> Result<Option<ProcessStat>> {
        self.read_stat(pid)
    }

    fn signal(&self, pid: Pid, kind: SignalKind) -> Result<Delivery> {
        send_signal(pid, kind)
    }
}

#[cfg(unix)]
fn send_signal(pid: Pid, kind: SignalKind) -> Result<Delivery> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid as NixPid;

    // pid 0 and negative values address process groups; never allowed here.
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| PdlError::Signal {
            pid,
            signal: kind.name(),
            details: "pid out of range".to_string(),
        })?;
    let signal = match kind {
        SignalKind::Stop => Signal::SIGSTOP,
        SignalKind::Continue => Signal::SIGCONT,
    };
    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) => Ok(Delivery::Delivered),
        Err(Errno::ESRCH) => Ok(Delivery::NotFound),
        Err(errno) => Err(PdlError::Signal {
            pid,
            signal: kind.name(),
            details: errno.desc().to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: Pid, _kind: SignalKind) -> Result<Delivery> {
    Err(PdlError::UnsupportedPlatform {
        details: "signal delivery requires a Unix platform".to_string(),
    })
}

#[cfg(unix)]
fn clock_ticks_per_second() -> u64 {
    use nix::unistd::{SysconfVar, sysconf};

    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => u64::try_from(ticks).unwrap_or(100),
        _ => 100,
    }
}

#[cfg(not(unix))]
fn clock_ticks_per_second() -> u64 {
    100
}

/// Parse the contents of `/proc/<pid>/stat`.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// and parentheses, so fields are located relative to the last `)`.
pub fn parse_proc_stat(pid: Pid, raw: &str, ticks_per_second: u64) -> Result<ProcessStat> {
    let malformed = |details: &str| PdlError::ProcParse {
        pid,
        details: details.to_string(),
    };

    let open = raw.find('(').ok_or_else(|| malformed("missing '(' before comm"))?;
    let close = raw.rfind(')').ok_or_else(|| malformed("missing ')' after comm"))?;
    if close < open {
        return Err(malformed("comm delimiters out of order"));
    }
    let comm = raw[open + 1..close].to_string();

    // Field 3 (state) is rest[0]; field N is rest[N - 3].
    let rest: Vec<&str> = raw[close + 1..].split_whitespace().collect();
    if rest.len() < 20 {
        return Err(malformed("too few fields"));
    }

    let state = rest[0].chars().next().ok_or_else(|| malformed("empty state"))?;
    let number = |index: usize, name: &str| -> Result<u64> {
        rest[index]
            .parse::<u64>()
            .map_err(|error| malformed(&format!("{name}={:?}: {error}", rest[index])))
    };
    let ppid = u32::try_from(number(1, "ppid")?).map_err(|_| malformed("ppid out of range"))?;
    let utime = number(11, "utime")?;
    let stime = number(12, "stime")?;
    let start_ticks = number(19, "starttime")?;

    Ok(ProcessStat {
        pid,
        ppid,
        comm,
        state,
        cpu_time: ticks_to_duration(utime.saturating_add(stime), ticks_per_second),
        start_ticks,
    })
}

fn ticks_to_duration(ticks: u64, ticks_per_second: u64) -> Duration {
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(ticks_per_second.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

// ──────────────────── mock ────────────────────

#[derive(Debug, Default)]
struct MockState {
    procs: BTreeMap<Pid, ProcessStat>,
    signals: Vec<(Pid, SignalKind)>,
    vanish_on_signal: HashSet<Pid>,
    denied: HashSet<Pid>,
}

/// In-memory mock implementation for deterministic tests.
#[derive(Debug, Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a running process with zero CPU time.
    pub fn spawn(&self, pid: Pid, ppid: Pid, comm: &str) {
        self.state.lock().procs.insert(
            pid,
            ProcessStat {
                pid,
                ppid,
                comm: comm.to_string(),
                state: 'R',
                cpu_time: Duration::ZERO,
                start_ticks: u64::from(pid),
            },
        );
    }

    /// Replace a process entry wholesale.
    pub fn insert(&self, stat: ProcessStat) {
        self.state.lock().procs.insert(stat.pid, stat);
    }

    /// Remove a process as if it exited.
    pub fn exit(&self, pid: Pid) {
        self.state.lock().procs.remove(&pid);
    }

    /// Charge CPU time to a process.
    pub fn add_cpu_time(&self, pid: Pid, delta: Duration) {
        if let Some(stat) = self.state.lock().procs.get_mut(&pid) {
            stat.cpu_time += delta;
        }
    }

    /// Make the next signal to `pid` find the process gone (and remove it).
    pub fn vanish_on_signal(&self, pid: Pid) {
        self.state.lock().vanish_on_signal.insert(pid);
    }

    /// Make every signal to `pid` fail with a permission error.
    pub fn deny_signals(&self, pid: Pid) {
        self.state.lock().denied.insert(pid);
    }

    /// Undo [`MockPlatform::deny_signals`].
    pub fn allow_signals(&self, pid: Pid) {
        self.state.lock().denied.remove(&pid);
    }

    /// Every signal attempt recorded so far, in order.
    #[must_use]
    pub fn signals(&self) -> Vec<(Pid, SignalKind)> {
        self.state.lock().signals.clone()
    }

    pub fn clear_signals(&self) {
        self.state.lock().signals.clear();
    }

    /// Whether the process is currently stopped by a `SIGSTOP`.
    #[must_use]
    pub fn is_stopped(&self, pid: Pid) -> bool {
        self.state
            .lock()
            .procs
            .get(&pid)
            .is_some_and(|stat| stat.state == 'T')
    }
}

impl ProcessPlatform for MockPlatform {
    fn processes(&self) -> Result<Vec<ProcessStat>> {
        Ok(self.state.lock().procs.values().cloned().collect())
    }

    fn process(&self, pid: Pid) -> Result<Option<ProcessStat>> {
        Ok(self.state.lock().procs.get(&pid).cloned())
    }

    fn signal(&self, pid: Pid, kind: SignalKind) -> Result<Delivery> {
        let mut state = self.state.lock();
        state.signals.push((pid, kind));
        if state.denied.contains(&pid) {
            return Err(PdlError::Signal {
                pid,
                signal: kind.name(),
                details: "Operation not permitted".to_string(),
            });
        }
        if state.vanish_on_signal.remove(&pid) {
            state.procs.remove(&pid);
        }
        let Some(stat) = state.procs.get_mut(&pid) else {
            return Ok(Delivery::NotFound);
        };
        stat.state = match kind {
            SignalKind::Stop => 'T',
            SignalKind::Continue => 'R',
        };
        Ok(Delivery::Delivered)
    }
}

/// Detect active platform implementation.
pub fn detect_platform() -> Result<Arc<dyn ProcessPlatform>> {
    #[cfg(target_os = "linux")]
    {
        if !has_procfs(Path::new("/proc")) {
            return Err(PdlError::UnsupportedPlatform {
                details: "procfs is not mounted at /proc".to_string(),
            });
        }
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(PdlError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}

/// Whether the given proc root looks like a mounted procfs.
#[must_use]
pub fn has_procfs(proc_root: &Path) -> bool {
    proc_root.join("self").join("stat").exists()
}
