//! Sampling loop
//!
//! Paces the attribution pipeline at two rates: RAPL counters are polled
//! every `rapl_period` so accumulators stay ahead of counter wraps, and an
//! attribution row is produced every `interval`. The loop is a single
//! cooperative thread; interruption is a flag set by the signal handler
//! and checked at each sleep boundary, so the trace written so far is
//! always durable.

use crate::attribution::{self, IntervalInput, ScalingFactors};
use crate::baseline::BaselinePower;
use crate::error::TracerError;
use crate::inventory::ThreadInventory;
use crate::probe::{HostSnapshot, SystemProbe};
use crate::rapl::{DomainKind, DomainReading, RaplReader};
use crate::topology::Topology;
use crate::trace_sink::TraceSink;
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pacing and scaling knobs for one tracing run
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Spacing between attribution samples
    pub interval: Duration,
    /// Spacing between RAPL counter polls
    pub rapl_period: Duration,
    pub factors: ScalingFactors,
}

/// Lifecycle of the sampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Calibrated,
    Running,
    Flushing,
    Aborting,
    Done,
}

/// Cumulative energy accounting reported when the loop stops
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub rows_written: u64,
    pub total_pkg_j: Vec<f64>,
    pub total_dram_j: Vec<f64>,
    pub baseline_pkg_j: Vec<f64>,
    pub baseline_dram_j: Vec<f64>,
    pub ascribed_pkg_j: Vec<f64>,
    pub ascribed_dram_j: Vec<f64>,
}

/// The attribution pipeline driver
pub struct Sampler {
    config: SamplerConfig,
    topology: Topology,
    rapl: RaplReader,
    probe: SystemProbe,
    inventory: ThreadInventory,
    baseline: BaselinePower,
    sink: TraceSink,
    stop: Arc<AtomicBool>,
    state: LoopState,
}

impl Sampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SamplerConfig,
        topology: Topology,
        rapl: RaplReader,
        probe: SystemProbe,
        inventory: ThreadInventory,
        baseline: BaselinePower,
        sink: TraceSink,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            topology,
            rapl,
            probe,
            inventory,
            baseline,
            sink,
            stop,
            state: LoopState::Init,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until the target exits or the stop flag is raised. The trace is
    /// flushed on every exit path, including errors.
    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_loop();

        self.state = if result.is_err() {
            LoopState::Aborting
        } else {
            LoopState::Flushing
        };
        if let Err(e) = self.sink.flush() {
            warn!(error = %e, "final trace flush failed");
        }
        self.state = LoopState::Done;

        match result {
            Ok(summary) => {
                self.log_summary(&summary);
                Ok(summary)
            }
            Err(e) => Err(e),
        }
    }

    fn run_loop(&mut self) -> Result<RunSummary> {
        let num_sockets = self.topology.num_sockets();
        let mut summary = RunSummary {
            rows_written: 0,
            total_pkg_j: vec![0.0; num_sockets],
            total_dram_j: vec![0.0; num_sockets],
            baseline_pkg_j: vec![0.0; num_sockets],
            baseline_dram_j: vec![0.0; num_sockets],
            ascribed_pkg_j: vec![0.0; num_sockets],
            ascribed_dram_j: vec![0.0; num_sockets],
        };

        // First endpoints. Thread baselines primed here contribute zero
        // deltas, so the first emitted row covers a full interval.
        self.rapl.poll();
        let mut prev_pkg = self.accumulated(DomainKind::Package);
        let mut prev_dram = self.accumulated(DomainKind::Dram);
        let mut prev_host: HostSnapshot = self.probe.snapshot(&self.topology)?;
        if !self.inventory.target_alive() {
            return Err(TracerError::TargetGone {
                pid: self.inventory.pid(),
            }
            .into());
        }
        self.inventory.collect(&self.topology)?;
        let mut lap_start = Instant::now();
        self.state = LoopState::Calibrated;
        debug!("first endpoints taken, baseline ready");

        self.state = LoopState::Running;
        loop {
            if !self.pace_until_next_sample(lap_start) {
                info!("stop requested, flushing trace");
                return Ok(summary);
            }

            if !self.inventory.target_alive() {
                if self.sink.rows_written() == 0 {
                    return Err(TracerError::TargetGone {
                        pid: self.inventory.pid(),
                    }
                    .into());
                }
                info!(pid = self.inventory.pid(), "target exited, flushing trace");
                return Ok(summary);
            }

            let now = Instant::now();
            let dt_s = now.duration_since(lap_start).as_secs_f64();

            let now_pkg = self.accumulated(DomainKind::Package);
            let now_dram = self.accumulated(DomainKind::Dram);
            // A failed host probe substitutes the last snapshot: the row
            // then carries zero activity deltas instead of aborting.
            let host = match self.probe.snapshot(&self.topology) {
                Ok(host) => host,
                Err(e) => {
                    warn!(error = %e, "host probe failed, substituting last snapshot");
                    prev_host.clone()
                }
            };
            let inv = match self.inventory.collect(&self.topology) {
                Ok(inv) => inv,
                // Exit raced us between the liveness check and the read.
                Err(_) if !self.inventory.target_alive() => {
                    if self.sink.rows_written() == 0 {
                        return Err(TracerError::TargetGone {
                            pid: self.inventory.pid(),
                        }
                        .into());
                    }
                    info!(pid = self.inventory.pid(), "target exited, flushing trace");
                    return Ok(summary);
                }
                Err(e) => return Err(e),
            };

            let input = IntervalInput {
                dt_s,
                host_pkg_delta_j: delta_readings(&now_pkg, &prev_pkg),
                host_dram_delta_j: delta_readings(&now_dram, &prev_dram),
                host_cpu_time_delta_s: prev_host
                    .cpu_time_per_socket
                    .iter()
                    .zip(&host.cpu_time_per_socket)
                    .map(|(then, now)| (now - then).max(0.0))
                    .collect(),
                host_numa_mem_mib: host.numa_mem_used_mib.clone(),
                target_cpu_time_delta_s: inv.cpu_time_delta_per_socket,
                target_mem_mib: inv.residency_mib,
                threads_per_socket: inv.threads_per_socket,
            };

            match attribution::attribute(&input, &self.baseline, self.config.factors) {
                Ok(rows) => {
                    if self.sink.append(Utc::now(), dt_s, &rows)? {
                        summary.rows_written = self.sink.rows_written();
                        for row in &rows {
                            summary.total_pkg_j[row.socket] += row.host_cpu_j;
                            summary.total_dram_j[row.socket] += row.host_dram_j;
                            summary.baseline_pkg_j[row.socket] += row.base_cpu_j;
                            summary.baseline_dram_j[row.socket] += row.base_dram_j;
                            summary.ascribed_pkg_j[row.socket] += row.target_cpu_j;
                            summary.ascribed_dram_j[row.socket] += row.target_dram_j;
                        }
                    }
                }
                Err(TracerError::ClockAnomaly { dt_s }) => {
                    warn!(dt_s, "clock anomaly, sample skipped");
                }
                Err(e) => return Err(e.into()),
            }

            prev_pkg = now_pkg;
            prev_dram = now_dram;
            prev_host = host;
            lap_start = now;
        }
    }

    /// High-rate RAPL polling until the next attribution boundary.
    /// Returns false when the stop flag was raised.
    fn pace_until_next_sample(&mut self, lap_start: Instant) -> bool {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return false;
            }
            let elapsed = lap_start.elapsed();
            if elapsed >= self.config.interval {
                let overrun = elapsed - self.config.interval;
                if overrun > self.config.rapl_period {
                    warn!(overrun_s = overrun.as_secs_f64(), "lap exceeded interval");
                }
                return true;
            }
            let remaining = self.config.interval - elapsed;
            thread::sleep(remaining.min(self.config.rapl_period));
            self.rapl.poll();
        }
    }

    fn accumulated(&self, kind: DomainKind) -> Vec<DomainReading> {
        (0..self.topology.num_sockets())
            .map(|s| self.rapl.accumulated(s, kind))
            .collect()
    }

    fn log_summary(&self, summary: &RunSummary) {
        info!(rows = summary.rows_written, "trace complete");
        for socket in 0..self.topology.num_sockets() {
            info!(
                socket,
                total_pkg_j = summary.total_pkg_j[socket],
                total_dram_j = summary.total_dram_j[socket],
                baseline_pkg_j = summary.baseline_pkg_j[socket],
                baseline_dram_j = summary.baseline_dram_j[socket],
                ascribed_pkg_j = summary.ascribed_pkg_j[socket],
                ascribed_dram_j = summary.ascribed_dram_j[socket],
                "socket energy totals"
            );
        }
    }
}

fn delta_readings(now: &[DomainReading], then: &[DomainReading]) -> Vec<DomainReading> {
    now.iter()
        .zip(then)
        .map(|(n, t)| n.delta_since(*t))
        .collect()
}
