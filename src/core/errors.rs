//! PDL-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, PdlError>;

/// Top-level error type for the process duty limiter.
///
/// Nothing inside a running controller is fatal; these errors surface from
/// configuration, platform probing, and thread spawning.
#[derive(Debug, Error)]
pub enum PdlError {
    #[error("[PDL-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[PDL-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[PDL-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[PDL-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[PDL-2001] process table parse failure for pid {pid}: {details}")]
    ProcParse { pid: u32, details: String },

    #[error("[PDL-2002] signal {signal} to pid {pid} failed: {details}")]
    Signal {
        pid: u32,
        signal: &'static str,
        details: String,
    },

    #[error("[PDL-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[PDL-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[PDL-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[PDL-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[PDL-3101] failed to spawn limiter for role {role}: {details}")]
    Spawn { role: String, details: String },

    #[error("[PDL-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl PdlError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "PDL-1001",
            Self::MissingConfig { .. } => "PDL-1002",
            Self::ConfigParse { .. } => "PDL-1003",
            Self::UnsupportedPlatform { .. } => "PDL-1101",
            Self::ProcParse { .. } => "PDL-2001",
            Self::Signal { .. } => "PDL-2002",
            Self::Serialization { .. } => "PDL-2101",
            Self::PermissionDenied { .. } => "PDL-3001",
            Self::Io { .. } => "PDL-3002",
            Self::ChannelClosed { .. } => "PDL-3003",
            Self::Spawn { .. } => "PDL-3101",
            Self::Runtime { .. } => "PDL-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::ProcParse { .. }
                | Self::Signal { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for PdlError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for PdlError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
