//! Error kinds for the attribution pipeline
//!
//! Startup failures abort with a diagnostic and a distinct exit code;
//! steady-state failures degrade gracefully and never discard the
//! in-progress trace.

use std::path::PathBuf;
use thiserror::Error;

/// Typed failures of the energy tracer
#[derive(Debug, Error)]
pub enum TracerError {
    /// Sysfs files not readable (RAPL requires root)
    #[error("permission denied reading {path}; RAPL sysfs requires root")]
    PermissionDenied { path: PathBuf },

    /// No RAPL package domain on this machine
    #[error("no RAPL package domain found under {root}")]
    UnsupportedHardware { root: PathBuf },

    /// Target PID vanished before the first sample was emitted
    #[error("target process {pid} disappeared before the first sample")]
    TargetGone { pid: i32 },

    /// Non-positive interval between two snapshots
    #[error("non-positive sample interval ({dt_s} s); clock anomaly")]
    ClockAnomaly { dt_s: f64 },

    /// Bad flags or an unusable baseline file
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TracerError {
    /// Process exit code for this error kind
    pub fn exit_code(&self) -> i32 {
        match self {
            TracerError::PermissionDenied { .. } => 1,
            TracerError::Config(_) => 1,
            TracerError::UnsupportedHardware { .. } => 2,
            TracerError::TargetGone { .. } => 3,
            // Never fatal: the sampling loop skips the sample instead.
            TracerError::ClockAnomaly { .. } => 1,
        }
    }
}
