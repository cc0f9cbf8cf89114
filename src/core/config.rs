//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{PdlError, Result};
use crate::monitor::duty_cycle::MIN_WORKING_RATE;

/// Full PDL configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub limiter: LimiterConfig,
    pub tracker: TrackerConfig,
    pub paths: PathsConfig,
    pub roles: Vec<RoleConfig>,
}

/// Control-loop timing knobs shared by every limiter instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Length of one work + sleep control period.
    pub period_ms: u64,
    /// Wait between polls while the target pid is unknown.
    pub resolve_backoff_ms: u64,
    /// Wait before retrying when the target has no live processes.
    pub idle_interval_ms: u64,
    /// Re-poll the target provider every this many iterations.
    pub repoll_every: u64,
    /// Work-slice overshoot above which a timing deviation is recorded.
    pub timing_tolerance_ms: u64,
    /// Emit a duty-cycle sample every this many controlled iterations (verbose mode).
    pub report_every: u64,
    /// Optional EMA blend factor applied to the working rate. `None` keeps the raw law.
    pub rate_smoothing: Option<f64>,
}

/// Per-process CPU usage sampling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Weight of the newest sample in the per-process usage average.
    pub usage_alpha: f64,
    /// Samples closer together than this keep the previous estimate.
    pub min_sample_interval_ms: u64,
}

/// Filesystem paths used by pdl.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
    pub jsonl_fallback: Option<PathBuf>,
}

/// One monitored role: a logical target plus the CPU budget it gets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleConfig {
    pub name: String,
    /// CPU budget as a percentage of one core, in (0, 100].
    pub limit_pct: f64,
    #[serde(default)]
    pub include_descendants: bool,
    /// Stop the limiter instead of idling once the target disappears.
    #[serde(default)]
    pub exit_when_absent: bool,
    pub target: TargetSpec,
}

impl RoleConfig {
    /// Limit as a fraction of one core.
    #[must_use]
    pub fn limit_fraction(&self) -> f64 {
        self.limit_pct / 100.0
    }
}

/// Where a role's process id comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetSpec {
    /// A fixed process id.
    Pid { pid: u32 },
    /// A file containing a process id, rewritten by the target on restart.
    Pidfile { path: PathBuf },
    /// The oldest process whose command name matches.
    Exe { name: String },
    /// A JSON health registry mapping role names to pids.
    Registry {
        file: PathBuf,
        /// Registry key; defaults to the role name.
        #[serde(default)]
        key: Option<String>,
    },
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            period_ms: 100,
            resolve_backoff_ms: 1_000,
            idle_interval_ms: 100,
            repoll_every: 100,
            timing_tolerance_ms: 10,
            report_every: 10,
            rate_smoothing: None,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            usage_alpha: 0.08,
            min_sample_interval_ms: 20,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[PDL-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("pdl").join("config.toml");
        let data = home_dir.join(".local").join("share").join("pdl");
        Self {
            config_file: cfg,
            jsonl_log: data.join("activity.jsonl"),
            jsonl_fallback: Some(PathBuf::from("/dev/shm/pdl.jsonl")),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| PdlError::Io {
                path: path_buf.clone(),
                source,
            })?;
            Self::from_toml_str(&raw)?
        } else if is_explicit_path {
            return Err(PdlError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without env overrides or validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over canonical JSON so the value is stable across releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Look up a role by name.
    #[must_use]
    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|role| role.name == name)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let limiter = &mut self.limiter;
        for (name, slot) in [
            ("PDL_LIMITER_PERIOD_MS", &mut limiter.period_ms),
            (
                "PDL_LIMITER_RESOLVE_BACKOFF_MS",
                &mut limiter.resolve_backoff_ms,
            ),
            ("PDL_LIMITER_IDLE_INTERVAL_MS", &mut limiter.idle_interval_ms),
            ("PDL_LIMITER_REPOLL_EVERY", &mut limiter.repoll_every),
            (
                "PDL_LIMITER_TIMING_TOLERANCE_MS",
                &mut limiter.timing_tolerance_ms,
            ),
            ("PDL_LIMITER_REPORT_EVERY", &mut limiter.report_every),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = parse_env_u64(name, &raw)?;
            }
        }

        if let Some(raw) = lookup("PDL_LIMITER_RATE_SMOOTHING") {
            let alpha = parse_env_f64("PDL_LIMITER_RATE_SMOOTHING", &raw)?;
            // Zero is the documented way to switch smoothing back off.
            limiter.rate_smoothing = (alpha > 0.0).then_some(alpha);
        }

        if let Some(raw) = lookup("PDL_TRACKER_USAGE_ALPHA") {
            self.tracker.usage_alpha = parse_env_f64("PDL_TRACKER_USAGE_ALPHA", &raw)?;
        }
        if let Some(raw) = lookup("PDL_TRACKER_MIN_SAMPLE_INTERVAL_MS") {
            self.tracker.min_sample_interval_ms =
                parse_env_u64("PDL_TRACKER_MIN_SAMPLE_INTERVAL_MS", &raw)?;
        }

        if let Some(raw) = lookup("PDL_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        for (name, val) in [
            ("period_ms", self.limiter.period_ms),
            ("repoll_every", self.limiter.repoll_every),
            ("report_every", self.limiter.report_every),
        ] {
            if val == 0 {
                return Err(PdlError::InvalidConfig {
                    details: format!("limiter.{name} must be >= 1"),
                });
            }
        }

        if let Some(alpha) = self.limiter.rate_smoothing
            && !(alpha > 0.0 && alpha < 1.0)
        {
            return Err(PdlError::InvalidConfig {
                details: format!("limiter.rate_smoothing must be in (0, 1), got {alpha}"),
            });
        }

        let alpha = self.tracker.usage_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(PdlError::InvalidConfig {
                details: format!("tracker.usage_alpha must be in (0, 1], got {alpha}"),
            });
        }

        let mut seen = HashSet::new();
        for role in &self.roles {
            if role.name.trim().is_empty() {
                return Err(PdlError::InvalidConfig {
                    details: "roles[].name must not be empty".to_string(),
                });
            }
            if !seen.insert(role.name.as_str()) {
                return Err(PdlError::InvalidConfig {
                    details: format!("duplicate role name {:?}", role.name),
                });
            }
            validate_limit_pct(&role.name, role.limit_pct)?;
            if let TargetSpec::Exe { name } = &role.target
                && name.trim().is_empty()
            {
                return Err(PdlError::InvalidConfig {
                    details: format!("role {:?}: exe target name must not be empty", role.name),
                });
            }
            if let TargetSpec::Pid { pid: 0 } = role.target {
                return Err(PdlError::InvalidConfig {
                    details: format!("role {:?}: pid target must be > 0", role.name),
                });
            }
        }

        Ok(())
    }
}

/// Smallest accepted limit. Below it the working-rate floor would exceed the budget.
pub const MIN_LIMIT_PCT: f64 = MIN_WORKING_RATE * 100.0;

/// Reject limits outside [`MIN_LIMIT_PCT`, 100].
pub fn validate_limit_pct(role: &str, limit_pct: f64) -> Result<()> {
    if !(MIN_LIMIT_PCT..=100.0).contains(&limit_pct) {
        return Err(PdlError::InvalidConfig {
            details: format!(
                "role {role:?}: limit_pct must be in [{MIN_LIMIT_PCT}, 100], got {limit_pct}"
            ),
        });
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| PdlError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_f64(name: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|error| PdlError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
[limiter]
period_ms = 50
repoll_every = 20

[tracker]
usage_alpha = 0.5

[[roles]]
name = "nidps"
limit_pct = 5.0
target = { kind = "registry", file = "/run/health.json" }

[[roles]]
name = "hidps"
limit_pct = 12.5
include_descendants = true
target = { kind = "exe", name = "hidps" }
"#;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl FnMut(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_control_loop_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.limiter.period_ms, 100);
        assert_eq!(cfg.limiter.resolve_backoff_ms, 1_000);
        assert_eq!(cfg.limiter.idle_interval_ms, 100);
        assert_eq!(cfg.limiter.repoll_every, 100);
        assert_eq!(cfg.limiter.timing_tolerance_ms, 10);
        assert!(cfg.limiter.rate_smoothing.is_none());
        assert!(cfg.roles.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_roles_and_target_kinds() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.limiter.period_ms, 50);
        assert_eq!(cfg.limiter.idle_interval_ms, 100, "unset keys keep defaults");
        assert_eq!(cfg.roles.len(), 2);

        let nidps = cfg.role("nidps").unwrap();
        assert!((nidps.limit_fraction() - 0.05).abs() < 1e-12);
        assert!(!nidps.include_descendants);
        assert_eq!(
            nidps.target,
            TargetSpec::Registry {
                file: PathBuf::from("/run/health.json"),
                key: None,
            }
        );

        let hidps = cfg.role("hidps").unwrap();
        assert!(hidps.include_descendants);
        assert_eq!(
            hidps.target,
            TargetSpec::Exe {
                name: "hidps".to_string()
            }
        );
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(lookup_from(&[
            ("PDL_LIMITER_PERIOD_MS", "250"),
            ("PDL_LIMITER_RATE_SMOOTHING", "0.3"),
            ("PDL_TRACKER_USAGE_ALPHA", "0.2"),
        ]))
        .unwrap();
        assert_eq!(cfg.limiter.period_ms, 250);
        assert_eq!(cfg.limiter.rate_smoothing, Some(0.3));
        assert!((cfg.tracker.usage_alpha - 0.2).abs() < 1e-12);

        cfg.apply_env_overrides_from(lookup_from(&[("PDL_LIMITER_RATE_SMOOTHING", "0")]))
            .unwrap();
        assert!(cfg.limiter.rate_smoothing.is_none());
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(lookup_from(&[("PDL_LIMITER_PERIOD_MS", "fast")]))
            .unwrap_err();
        assert_eq!(err.code(), "PDL-1003");
    }

    #[test]
    fn validation_rejects_bad_limits() {
        let mut cfg = Config::from_toml_str(SAMPLE).unwrap();
        cfg.roles[0].limit_pct = 0.0;
        assert_eq!(cfg.validate().unwrap_err().code(), "PDL-1001");
        cfg.roles[0].limit_pct = 100.5;
        assert!(cfg.validate().is_err());
        cfg.roles[0].limit_pct = 100.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn limits_below_the_rate_floor_are_rejected() {
        let mut cfg = Config::from_toml_str(SAMPLE).unwrap();
        cfg.roles[0].limit_pct = 0.05;
        assert_eq!(cfg.validate().unwrap_err().code(), "PDL-1001");
        cfg.roles[0].limit_pct = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.roles[0].limit_pct = MIN_LIMIT_PCT;
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_duplicate_roles_and_zero_period() {
        let mut cfg = Config::from_toml_str(SAMPLE).unwrap();
        cfg.roles[1].name = "nidps".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.limiter.period_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_smoothing() {
        let mut cfg = Config::default();
        cfg.limiter.rate_smoothing = Some(1.0);
        assert!(cfg.validate().is_err());
        cfg.limiter.rate_smoothing = Some(0.5);
        cfg.validate().unwrap();
    }

    #[test]
    fn load_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert_eq!(err.code(), "PDL-1002");
    }

    #[test]
    fn load_reads_file_and_records_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.paths.config_file, path);
        assert_eq!(cfg.roles.len(), 2);
    }

    #[test]
    fn stable_hash_is_deterministic() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.stable_hash().unwrap(), cfg.clone().stable_hash().unwrap());
        let mut other = cfg.clone();
        other.limiter.period_ms += 1;
        assert_ne!(cfg.stable_hash().unwrap(), other.stable_hash().unwrap());
    }
}
