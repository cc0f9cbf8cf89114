//! Process set tracking: enumerate a target and its descendants each control
//! iteration and attach a CPU usage estimate to every member.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::config::TrackerConfig;
use crate::core::errors::Result;
use crate::monitor::usage::UsageEstimator;
use crate::platform::pal::{Delivery, Pid, ProcessPlatform, ProcessStat, SignalKind};

/// One process believed to belong to the controlled set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSetMember {
    pub pid: Pid,
    /// Fraction of one core used during the previous interval; `None` on first sight.
    pub usage: Option<f64>,
}

/// Membership valid for exactly one control iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSetSnapshot {
    target: Pid,
    members: Vec<ProcessSetMember>,
}

impl ProcessSetSnapshot {
    #[must_use]
    pub fn new(target: Pid, members: Vec<ProcessSetMember>) -> Self {
        Self { target, members }
    }

    /// A snapshot for a target with no live processes.
    #[must_use]
    pub fn empty(target: Pid) -> Self {
        Self::new(target, Vec::new())
    }

    #[must_use]
    pub fn target(&self) -> Pid {
        self.target
    }

    #[must_use]
    pub fn members(&self) -> &[ProcessSetMember] {
        &self.members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.members.iter().any(|member| member.pid == pid)
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.members.iter().map(|member| member.pid)
    }

    /// Drop a member for the rest of the iteration. Returns whether it was present.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member.pid != pid);
        self.members.len() != before
    }

    /// Sum of the known member usages; `None` only when no member is measurable.
    ///
    /// Not clamped: descendants on several cores can push the sum past 1.
    #[must_use]
    pub fn aggregate_usage(&self) -> Option<f64> {
        self.members
            .iter()
            .filter_map(|member| member.usage)
            .fold(None, |acc, usage| Some(acc.unwrap_or(0.0) + usage))
    }
}

/// Contract the duty-cycle limiter consumes.
pub trait ProcessTracker: Send {
    /// Re-walk the process tree rooted at `target`.
    fn refresh(
        &mut self,
        target: Pid,
        include_descendants: bool,
        now: Instant,
    ) -> Result<ProcessSetSnapshot>;

    /// Latest usage estimate for a tracked pid.
    fn usage_of(&self, pid: Pid) -> Option<f64>;

    /// Deliver stop/continue to one member.
    fn signal(&self, pid: Pid, kind: SignalKind) -> Result<Delivery>;

    /// Forget a process that has disappeared.
    fn remove(&mut self, pid: Pid);

    /// Forget every process (target changed).
    fn reset(&mut self);
}

/// Tracker backed by a [`ProcessPlatform`].
///
/// The calling process is never a member: stopping it would also stop the
/// loop that has to resume everyone else.
pub struct ProcessSetTracker {
    platform: Arc<dyn ProcessPlatform>,
    own_pid: Pid,
    usage_alpha: f64,
    min_sample_interval: Duration,
    history: HashMap<Pid, UsageEstimator>,
}

impl ProcessSetTracker {
    #[must_use]
    pub fn new(platform: Arc<dyn ProcessPlatform>, config: &TrackerConfig) -> Self {
        Self {
            platform,
            own_pid: std::process::id(),
            usage_alpha: config.usage_alpha,
            min_sample_interval: Duration::from_millis(config.min_sample_interval_ms),
            history: HashMap::new(),
        }
    }

    /// Number of processes with usage history.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.history.len()
    }

    fn collect_members(&self, target: Pid, include_descendants: bool) -> Result<Vec<ProcessStat>> {
        if !include_descendants {
            return Ok(self
                .platform
                .process(target)?
                .filter(|stat| stat.pid != self.own_pid && !stat.is_defunct())
                .into_iter()
                .collect());
        }

        let table = self.platform.processes()?;
        if !table.iter().any(|stat| stat.pid == target) {
            return Ok(Vec::new());
        }

        let mut children: HashMap<Pid, Vec<usize>> = HashMap::new();
        let mut index_of: HashMap<Pid, usize> = HashMap::with_capacity(table.len());
        for (index, stat) in table.iter().enumerate() {
            index_of.insert(stat.pid, index);
            if stat.pid != stat.ppid {
                children.entry(stat.ppid).or_default().push(index);
            }
        }

        let mut members = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([target]);
        while let Some(pid) = queue.pop_front() {
            if !visited.insert(pid) {
                continue;
            }
            let Some(&index) = index_of.get(&pid) else {
                continue;
            };
            let stat = &table[index];
            if stat.pid != self.own_pid && !stat.is_defunct() {
                members.push(stat.clone());
            }
            if let Some(kids) = children.get(&pid) {
                queue.extend(kids.iter().map(|&kid| table[kid].pid));
            }
        }
        Ok(members)
    }
}

impl ProcessTracker for ProcessSetTracker {
    fn refresh(
        &mut self,
        target: Pid,
        include_descendants: bool,
        now: Instant,
    ) -> Result<ProcessSetSnapshot> {
        let stats = self.collect_members(target, include_descendants)?;
        let (alpha, min_interval) = (self.usage_alpha, self.min_sample_interval);

        let mut members = Vec::with_capacity(stats.len());
        for stat in &stats {
            let estimator = self
                .history
                .entry(stat.pid)
                .or_insert_with(|| UsageEstimator::new(alpha, min_interval));
            let usage = estimator.update(stat.cpu_time, stat.start_ticks, now);
            members.push(ProcessSetMember {
                pid: stat.pid,
                usage,
            });
        }

        let live: HashSet<Pid> = members.iter().map(|member| member.pid).collect();
        self.history.retain(|pid, _| live.contains(pid));

        Ok(ProcessSetSnapshot::new(target, members))
    }

    fn usage_of(&self, pid: Pid) -> Option<f64> {
        self.history.get(&pid).and_then(UsageEstimator::usage)
    }

    fn signal(&self, pid: Pid, kind: SignalKind) -> Result<Delivery> {
        self.platform.signal(pid, kind)
    }

    fn remove(&mut self, pid: Pid) {
        self.history.remove(&pid);
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}
