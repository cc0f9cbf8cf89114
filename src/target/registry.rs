//! Role registries: an in-process table of role → pid shared by concurrent
//! limiters, and a JSON health-registry file written by an external monitor.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::errors::{PdlError, Result};
use crate::platform::pal::Pid;
use crate::target::TargetProvider;

/// Concurrency-safe role → pid table.
///
/// Writers are whatever tracks service health; limiters only read.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    entries: Arc<RwLock<HashMap<String, Pid>>>,
}

impl RoleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pid serving `role`. A pid of 0 clears the entry.
    pub fn set(&self, role: &str, pid: Pid) {
        let mut entries = self.entries.write();
        if pid == 0 {
            entries.remove(role);
        } else {
            entries.insert(role.to_string(), pid);
        }
    }

    pub fn clear(&self, role: &str) {
        self.entries.write().remove(role);
    }

    #[must_use]
    pub fn get(&self, role: &str) -> Option<Pid> {
        self.entries.read().get(role).copied()
    }

    /// Read-only provider view for one role.
    #[must_use]
    pub fn provider(&self, role: &str) -> RoleTarget {
        RoleTarget {
            registry: self.clone(),
            role: role.to_string(),
        }
    }
}

/// One role's view of a [`RoleRegistry`].
#[derive(Debug, Clone)]
pub struct RoleTarget {
    registry: RoleRegistry,
    role: String,
}

impl TargetProvider for RoleTarget {
    fn current_target(&self) -> Option<Pid> {
        self.registry.get(&self.role)
    }

    fn describe(&self) -> String {
        format!("registry role {}", self.role)
    }
}

/// Health registry persisted as a JSON object mapping role names to pids.
///
/// ```json
/// { "nidps": 1234, "hidps": 0, "updated_at": "2026-10-16T10:00:00Z" }
/// ```
///
/// Non-numeric values are ignored and 0 means "not running".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryFileTarget {
    file: PathBuf,
    key: String,
}

impl RegistryFileTarget {
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            key: key.into(),
        }
    }

    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Load the whole registry.
    pub fn load(&self) -> Result<HashMap<String, Pid>> {
        let raw =
            fs::read_to_string(&self.file).map_err(|source| PdlError::io(&self.file, source))?;
        parse_registry(&raw)
    }
}

impl TargetProvider for RegistryFileTarget {
    fn current_target(&self) -> Option<Pid> {
        self.load().ok()?.get(&self.key).copied()
    }

    fn describe(&self) -> String {
        format!("registry {} [{}]", self.file.display(), self.key)
    }
}

/// Parse a registry document, keeping only positive integer pids.
pub fn parse_registry(raw: &str) -> Result<HashMap<String, Pid>> {
    let document: HashMap<String, serde_json::Value> = serde_json::from_str(raw)?;
    Ok(document
        .into_iter()
        .filter_map(|(role, value)| {
            let pid = Pid::try_from(value.as_u64()?).ok()?;
            (pid != 0).then_some((role, pid))
        })
        .collect())
}
