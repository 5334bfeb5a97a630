//! CLI argument parsing for Vatio

use clap::{Parser, ValueEnum};

/// Log verbosity
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Lifecycle and summary messages only
    Info,
    /// Per-interval share diagnostics
    Debug,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vatio")]
#[command(version)]
#[command(about = "NUMA-aware per-process energy attribution via Intel RAPL", long_about = None)]
pub struct Cli {
    /// Probe topology, RAPL support and permissions, then exit
    #[arg(long)]
    pub check: bool,

    /// Run idle-power calibration, write the baseline file, then exit
    #[arg(long)]
    pub basepower: bool,

    /// Attach to a running process by PID
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<i32>,

    /// Attach to a running process by executable name
    #[arg(long = "name", value_name = "NAME", conflicts_with = "pid")]
    pub name: Option<String>,

    /// Trace output file (CSV)
    #[arg(long = "output", value_name = "FILE", default_value = "vatio_trace.csv")]
    pub output: String,

    /// Baseline power file written by --basepower and read at attach
    #[arg(
        long = "basefile",
        value_name = "FILE",
        default_value = "baseline_power.json"
    )]
    pub basefile: String,

    /// Sampling window in seconds for baseline power estimation
    #[arg(long = "base_period", value_name = "SECONDS", default_value = "2.0")]
    pub base_period: f64,

    /// Spacing in seconds between RAPL counter polls
    #[arg(long = "rapl_period", value_name = "SECONDS", default_value = "0.01")]
    pub rapl_period: f64,

    /// Spacing in seconds between attribution samples
    #[arg(long = "interval", value_name = "SECONDS", default_value = "1.0")]
    pub interval: f64,

    /// Non-linear scaling exponent for CPU package energy
    #[arg(long = "gamma", value_name = "GAMMA", default_value = "0.3")]
    pub gamma: f64,

    /// Non-linear scaling exponent for DRAM energy
    #[arg(long = "delta", value_name = "DELTA", default_value = "0.2")]
    pub delta: f64,

    /// Logging level
    #[arg(long = "loglvl", value_enum, default_value = "info")]
    pub loglvl: LogLevel,
}

impl Cli {
    /// Reject flag combinations clap cannot express: pacing values must be
    /// positive and exponents must keep the share transform well-formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval <= 0.0 {
            return Err(format!("--interval must be positive, got {}", self.interval));
        }
        if self.rapl_period <= 0.0 {
            return Err(format!(
                "--rapl_period must be positive, got {}",
                self.rapl_period
            ));
        }
        if self.rapl_period > self.interval {
            return Err(format!(
                "--rapl_period ({}) must not exceed --interval ({})",
                self.rapl_period, self.interval
            ));
        }
        if self.base_period <= 0.0 {
            return Err(format!(
                "--base_period must be positive, got {}",
                self.base_period
            ));
        }
        for (flag, value) in [("--gamma", self.gamma), ("--delta", self.delta)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("{} must be in (0, 1], got {}", flag, value));
            }
        }
        Ok(())
    }
}
