//! Static (idle) power baseline
//!
//! A calibration run measures average idle power per socket and domain
//! over a quiet window and persists it as JSON. The attribution engine
//! multiplies these watts by the interval length and subtracts the result
//! from measured host energy before crediting anything to the target.

use crate::rapl::{DomainKind, RaplReader};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// On-disk schema: watts per socket, per domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub cpu: Vec<f64>,
    pub dram: Vec<f64>,
}

/// Idle power per socket, in watts
#[derive(Debug, Clone)]
pub struct BaselinePower {
    pub pkg_watts: Vec<f64>,
    pub dram_watts: Vec<f64>,
}

impl BaselinePower {
    /// All-zero baseline (attribution then works on raw host energy)
    pub fn zero(num_sockets: usize) -> Self {
        Self {
            pkg_watts: vec![0.0; num_sockets],
            dram_watts: vec![0.0; num_sockets],
        }
    }

    /// Load a baseline file. A missing file degrades to a zero baseline
    /// with a warning; a file of the wrong shape is a configuration error.
    pub fn load(path: &Path, num_sockets: usize) -> Result<Self> {
        if !path.is_file() {
            warn!(
                basefile = %path.display(),
                "baseline file not found, subtracting zero idle power"
            );
            return Ok(Self::zero(num_sockets));
        }

        let raw =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let record: BaselineRecord =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

        if record.cpu.len() != num_sockets || record.dram.len() != num_sockets {
            anyhow::bail!(
                "baseline file {} covers {} sockets, host has {}",
                path.display(),
                record.cpu.len(),
                num_sockets
            );
        }

        Ok(Self {
            pkg_watts: record.cpu,
            dram_watts: record.dram,
        })
    }

    /// Persist as the JSON schema consumed by `load`
    pub fn save(&self, path: &Path) -> Result<()> {
        let record = BaselineRecord {
            cpu: self.pkg_watts.clone(),
            dram: self.dram_watts.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(basefile = %path.display(), "baseline power saved");
        Ok(())
    }

    /// Calibration: average power over one quiet window. The caller is
    /// responsible for running this on an otherwise idle machine.
    pub fn estimate(reader: &mut RaplReader, window: Duration) -> Self {
        let num_sockets = reader.num_sockets();
        let before: Vec<_> = (0..num_sockets)
            .map(|s| {
                (
                    reader.accumulated(s, DomainKind::Package),
                    reader.accumulated(s, DomainKind::Dram),
                )
            })
            .collect();

        thread::sleep(window);
        reader.poll();

        let window_s = window.as_secs_f64();
        let mut pkg_watts = vec![0.0; num_sockets];
        let mut dram_watts = vec![0.0; num_sockets];
        for (socket, (pkg_before, dram_before)) in before.into_iter().enumerate() {
            pkg_watts[socket] = reader
                .accumulated(socket, DomainKind::Package)
                .delta_since(pkg_before)
                .joules_or(0.0)
                / window_s;
            dram_watts[socket] = reader
                .accumulated(socket, DomainKind::Dram)
                .delta_since(dram_before)
                .joules_or(0.0)
                / window_s;
        }

        info!(?pkg_watts, ?dram_watts, window_s, "estimated baseline power");
        Self {
            pkg_watts,
            dram_watts,
        }
    }
}
