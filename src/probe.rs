//! Host-wide activity probe
//!
//! Reads aggregate non-idle CPU time per socket from `/proc/stat` and
//! resident NUMA memory per node from the sysfs node meminfo files. One
//! snapshot is taken at each attribution boundary; the engine works on
//! deltas between consecutive snapshots.

use crate::topology::Topology;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Host activity at one sample boundary
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    /// Aggregate non-idle CPU seconds per socket since boot
    pub cpu_time_per_socket: Vec<f64>,
    /// Resident memory per NUMA node in MiB
    pub numa_mem_used_mib: Vec<f64>,
}

/// Field of a node meminfo file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemField {
    Total,
    Free,
    Used,
}

impl MemField {
    fn label(self) -> &'static str {
        match self {
            MemField::Total => "MemTotal",
            MemField::Free => "MemFree",
            MemField::Used => "MemUsed",
        }
    }
}

/// Reader over `/proc/stat` and the sysfs NUMA node tree
#[derive(Debug)]
pub struct SystemProbe {
    stat_path: PathBuf,
    node_root: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            stat_path: PathBuf::from("/proc/stat"),
            node_root: PathBuf::from("/sys/devices/system/node"),
        }
    }

    /// Probe over arbitrary roots (tests use synthetic files)
    pub fn with_roots(stat_path: PathBuf, node_root: PathBuf) -> Self {
        Self {
            stat_path,
            node_root,
        }
    }

    /// Take a host snapshot at the current instant
    pub fn snapshot(&self, topo: &Topology) -> Result<HostSnapshot> {
        Ok(HostSnapshot {
            cpu_time_per_socket: self.cpu_time_per_socket(topo)?,
            numa_mem_used_mib: self.numa_mem_mib(topo.num_sockets(), MemField::Used)?,
        })
    }

    /// Sum non-idle jiffies of every core belonging to each socket and
    /// convert to seconds
    pub fn cpu_time_per_socket(&self, topo: &Topology) -> Result<Vec<f64>> {
        let raw = fs::read_to_string(&self.stat_path)
            .with_context(|| format!("reading {}", self.stat_path.display()))?;

        let mut per_socket = topo.zeroed();
        for line in raw.lines() {
            let Some(rest) = line.strip_prefix("cpu") else {
                continue;
            };
            // Per-core lines attach the id to the prefix ("cpuN ..."); the
            // aggregate "cpu  ..." line leaves it empty and is skipped.
            let Some((id, counters)) = rest.split_once(' ') else {
                continue;
            };
            let Ok(core) = id.parse::<usize>() else {
                continue;
            };

            let jiffies: Vec<u64> = counters
                .split_whitespace()
                .map(|f| f.parse().unwrap_or(0))
                .collect();
            if jiffies.len() < 8 {
                warn!(core, "short cpu line in {}", self.stat_path.display());
                continue;
            }
            // user nice system idle iowait irq softirq steal: idle and
            // iowait are excluded from busy time.
            let busy = jiffies[0] + jiffies[1] + jiffies[2] + jiffies[5] + jiffies[6] + jiffies[7];

            match topo.socket_of(core) {
                Some(socket) => per_socket[socket] += busy as f64 / topo.clock_tick_hz(),
                None => warn!(core, "core not in topology map"),
            }
        }
        Ok(per_socket)
    }

    /// Read one meminfo field for every NUMA node, in MiB
    pub fn numa_mem_mib(&self, num_sockets: usize, field: MemField) -> Result<Vec<f64>> {
        let mut per_node = vec![0.0; num_sockets];
        for (node, mem) in per_node.iter_mut().enumerate() {
            let path = self.node_root.join(format!("node{}/meminfo", node));
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            *mem = parse_meminfo_kib(&raw, field.label())
                .with_context(|| format!("no {} in {}", field.label(), path.display()))?
                / 1024.0;
        }
        Ok(per_node)
    }
}

/// Extract a `Node N <label>: <value> kB` line value in KiB
fn parse_meminfo_kib(raw: &str, label: &str) -> Option<f64> {
    let needle = format!("{}:", label);
    for line in raw.lines() {
        let mut tokens = line.split_whitespace();
        // Lines read "Node 0 MemTotal: 32614808 kB".
        let (Some("Node"), Some(_), Some(key)) = (tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };
        if key == needle {
            return tokens.next().and_then(|v| v.parse::<f64>().ok());
        }
    }
    None
}
