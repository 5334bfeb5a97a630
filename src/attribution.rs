//! Energy attribution engine
//!
//! Combines RAPL deltas, host activity deltas, and target thread activity
//! into per-socket CPU and DRAM energy shares for one interval. The
//! credited share is a power-law transform of the raw activity fraction:
//! marginal active energy grows sub-linearly with utilization, so a small
//! tenant still carries part of the socket's activation cost.

use crate::baseline::BaselinePower;
use crate::error::TracerError;
use crate::rapl::DomainReading;
use tracing::warn;

/// Guard against division by zero in activity ratios
pub const SMALL_CONST: f64 = 1e-5;

/// Per-domain power-law exponents, both in (0, 1]
#[derive(Debug, Clone, Copy)]
pub struct ScalingFactors {
    /// CPU package exponent (gamma)
    pub gamma: f64,
    /// DRAM exponent (delta)
    pub delta: f64,
}

impl Default for ScalingFactors {
    fn default() -> Self {
        Self {
            gamma: 0.3,
            delta: 0.2,
        }
    }
}

/// Everything the engine needs for one interval, all vectors per socket
#[derive(Debug, Clone)]
pub struct IntervalInput {
    pub dt_s: f64,
    /// Package energy delta over the interval
    pub host_pkg_delta_j: Vec<DomainReading>,
    /// DRAM energy delta over the interval
    pub host_dram_delta_j: Vec<DomainReading>,
    /// Host non-idle CPU seconds over the interval
    pub host_cpu_time_delta_s: Vec<f64>,
    /// Host resident NUMA memory at the interval end, MiB
    pub host_numa_mem_mib: Vec<f64>,
    /// Target CPU seconds over the interval
    pub target_cpu_time_delta_s: Vec<f64>,
    /// Target resident NUMA memory at the interval end, MiB
    pub target_mem_mib: Vec<f64>,
    /// Live target threads per socket at the interval end
    pub threads_per_socket: Vec<u32>,
}

/// Attribution result for one socket over one interval
#[derive(Debug, Clone)]
pub struct SocketAttribution {
    pub socket: usize,
    /// Raw measured host energy (DRAM NaN when unsupported)
    pub host_cpu_j: f64,
    pub host_dram_j: f64,
    /// Idle energy subtracted before crediting
    pub base_cpu_j: f64,
    pub base_dram_j: f64,
    /// Energy credited to the target
    pub target_cpu_j: f64,
    pub target_dram_j: f64,
    /// Power-law shares actually applied
    pub cpu_share: f64,
    pub dram_share: f64,
    pub n_threads: u32,
    /// Raw fraction exceeded 1.0 and was clamped (scheduler race)
    pub share_clamped: bool,
}

/// Power-law share transform. Preserves share(0) = 0 and share(1) = 1 and
/// is monotonically increasing in the fraction.
pub fn scale_share(fraction: f64, exponent: f64) -> f64 {
    fraction.clamp(0.0, 1.0).powf(exponent)
}

/// Attribute one interval. Fails only on a non-positive interval; every
/// other anomaly degrades to a clamped or NaN field in the output.
pub fn attribute(
    input: &IntervalInput,
    baseline: &BaselinePower,
    factors: ScalingFactors,
) -> Result<Vec<SocketAttribution>, TracerError> {
    if input.dt_s <= 0.0 {
        return Err(TracerError::ClockAnomaly { dt_s: input.dt_s });
    }

    let num_sockets = input.host_pkg_delta_j.len();
    let mut rows = Vec::with_capacity(num_sockets);

    for socket in 0..num_sockets {
        let (cpu_fraction, cpu_clamped) = activity_fraction(
            input.target_cpu_time_delta_s[socket],
            input.host_cpu_time_delta_s[socket],
        );
        let cpu_share = scale_share(cpu_fraction, factors.gamma);
        let (host_cpu_j, base_cpu_j, target_cpu_j) = credit_domain(
            input.host_pkg_delta_j[socket],
            baseline.pkg_watts[socket],
            input.dt_s,
            cpu_share,
            socket,
            "package",
        );

        // DRAM is credited by residency, but only while the target is
        // actually scheduled on the socket this interval.
        let (dram_fraction, dram_clamped) = if input.threads_per_socket[socket] == 0 {
            (0.0, false)
        } else {
            activity_fraction(
                input.target_mem_mib[socket],
                input.host_numa_mem_mib[socket],
            )
        };
        let dram_supported = input.host_dram_delta_j[socket].is_supported();
        let dram_share = if dram_supported {
            scale_share(dram_fraction, factors.delta)
        } else {
            f64::NAN
        };
        let (host_dram_j, base_dram_j, target_dram_j) = if dram_supported {
            credit_domain(
                input.host_dram_delta_j[socket],
                baseline.dram_watts[socket],
                input.dt_s,
                dram_share,
                socket,
                "dram",
            )
        } else {
            (f64::NAN, f64::NAN, f64::NAN)
        };

        rows.push(SocketAttribution {
            socket,
            host_cpu_j,
            host_dram_j,
            base_cpu_j,
            base_dram_j,
            target_cpu_j,
            target_dram_j,
            cpu_share,
            dram_share,
            n_threads: input.threads_per_socket[socket],
            share_clamped: cpu_clamped || dram_clamped,
        });
    }

    Ok(rows)
}

/// Clamped target/host activity ratio; flags ratios past 1.0
fn activity_fraction(target: f64, host: f64) -> (f64, bool) {
    let raw = target / host.max(SMALL_CONST);
    (raw.clamp(0.0, 1.0), raw > 1.0)
}

/// Subtract idle energy and apply the share to what remains
fn credit_domain(
    host_delta: DomainReading,
    base_watts: f64,
    dt_s: f64,
    share: f64,
    socket: usize,
    domain: &str,
) -> (f64, f64, f64) {
    let host_j = host_delta.joules_or(f64::NAN);
    let base_j = base_watts * dt_s;
    let active_j = host_j - base_j;
    if active_j < 0.0 {
        warn!(socket, domain, host_j, base_j, "host energy below baseline");
    }
    let active_j = active_j.max(0.0);
    (host_j, base_j, share * active_j)
}
