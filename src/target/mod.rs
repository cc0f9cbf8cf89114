//! Target acquisition: where a limiter learns which pid it should regulate.
//!
//! Providers are read accessors. They are polled when a limiter has no target
//! and periodically while it holds one, so a restarted program is picked up
//! under its new pid.

#![allow(missing_docs)]

pub mod registry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::config::TargetSpec;
use crate::core::errors::{PdlError, Result};
use crate::platform::pal::{Pid, ProcessPlatform};

pub use registry::{RegistryFileTarget, RoleRegistry, RoleTarget};

/// Read-only source of the pid currently serving a role.
pub trait TargetProvider: Send + Sync {
    /// Current pid, `None` while unknown.
    fn current_target(&self) -> Option<Pid>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl<T: TargetProvider + ?Sized> TargetProvider for Box<T> {
    fn current_target(&self) -> Option<Pid> {
        (**self).current_target()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl<T: TargetProvider + ?Sized> TargetProvider for Arc<T> {
    fn current_target(&self) -> Option<Pid> {
        (**self).current_target()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// A pid fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTarget(pub Pid);

impl TargetProvider for FixedTarget {
    fn current_target(&self) -> Option<Pid> {
        (self.0 != 0).then_some(self.0)
    }

    fn describe(&self) -> String {
        format!("pid {}", self.0)
    }
}

/// A pid read from a file on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFileTarget {
    path: PathBuf,
}

impl PidFileTarget {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file. `Ok(None)` for an empty file or pid 0.
    pub fn read(&self) -> Result<Option<Pid>> {
        let raw =
            fs::read_to_string(&self.path).map_err(|source| PdlError::io(&self.path, source))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let pid = trimmed
            .parse::<Pid>()
            .map_err(|error| PdlError::ConfigParse {
                context: "pidfile",
                details: format!("{}: {trimmed:?}: {error}", self.path.display()),
            })?;
        Ok((pid != 0).then_some(pid))
    }
}

impl TargetProvider for PidFileTarget {
    fn current_target(&self) -> Option<Pid> {
        // A missing or half-written file reads as "unknown"; the next poll retries.
        self.read().ok().flatten()
    }

    fn describe(&self) -> String {
        format!("pidfile {}", self.path.display())
    }
}

/// The oldest live process whose command name matches.
pub struct ExecutableTarget {
    name: String,
    platform: Arc<dyn ProcessPlatform>,
}

impl ExecutableTarget {
    #[must_use]
    pub fn new(name: impl Into<String>, platform: Arc<dyn ProcessPlatform>) -> Self {
        let name = name.into();
        // Accept a path; the kernel only records the basename.
        let name = Path::new(&name)
            .file_name()
            .map_or_else(|| name.clone(), |base| base.to_string_lossy().into_owned());
        Self { name, platform }
    }

    /// Scan the process table for a match.
    pub fn find(&self) -> Result<Option<Pid>> {
        let own = std::process::id();
        let found = self
            .platform
            .processes()?
            .into_iter()
            .filter(|stat| {
                stat.pid != own && !stat.is_defunct() && comm_matches(&stat.comm, &self.name)
            })
            .min_by_key(|stat| (stat.start_ticks, stat.pid))
            .map(|stat| stat.pid);
        Ok(found)
    }
}

impl TargetProvider for ExecutableTarget {
    fn current_target(&self) -> Option<Pid> {
        self.find().ok().flatten()
    }

    fn describe(&self) -> String {
        format!("executable {}", self.name)
    }
}

/// `comm` is truncated to 15 bytes by the kernel.
fn comm_matches(comm: &str, name: &str) -> bool {
    const TASK_COMM_LEN: usize = 15;
    if comm == name {
        return true;
    }
    name.len() > TASK_COMM_LEN
        && comm.len() == TASK_COMM_LEN
        && name.as_bytes().starts_with(comm.as_bytes())
}

/// Build the provider described by a role's configuration.
#[must_use]
pub fn provider_for(
    spec: &TargetSpec,
    role: &str,
    platform: &Arc<dyn ProcessPlatform>,
) -> Box<dyn TargetProvider> {
    match spec {
        TargetSpec::Pid { pid } => Box::new(FixedTarget(*pid)),
        TargetSpec::Pidfile { path } => Box::new(PidFileTarget::new(path.clone())),
        TargetSpec::Exe { name } => {
            Box::new(ExecutableTarget::new(name.clone(), Arc::clone(platform)))
        }
        TargetSpec::Registry { file, key } => Box::new(RegistryFileTarget::new(
            file.clone(),
            key.clone().unwrap_or_else(|| role.to_string()),
        )),
    }
}
