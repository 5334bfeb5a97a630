//! CPU topology discovery
//!
//! Maps logical cores to physical packages (sockets) from sysfs. In the
//! supported topology each socket is associated with exactly one NUMA node,
//! so socket indices double as NUMA node indices throughout the pipeline.

use anyhow::{Context, Result};
use nix::libc;
use std::fs;
use std::path::{Path, PathBuf};

/// Default sysfs location of per-cpu topology files
pub const DEFAULT_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Fallback when sysconf reports no clock-tick rate
const DEFAULT_CLK_TCK: f64 = 100.0;

/// Core-to-socket mapping plus host timing constants
#[derive(Debug, Clone)]
pub struct Topology {
    /// Index = logical core id, value = physical package id
    core_socket_map: Vec<usize>,
    num_sockets: usize,
    clock_tick_hz: f64,
    page_size_bytes: u64,
}

impl Topology {
    /// Discover topology from the live sysfs tree
    pub fn discover() -> Result<Self> {
        Self::discover_at(Path::new(DEFAULT_CPU_ROOT))
    }

    /// Discover topology from an arbitrary sysfs root (tests point this at
    /// a synthetic tree)
    pub fn discover_at(cpu_root: &Path) -> Result<Self> {
        let mut core_socket_map = Vec::new();
        loop {
            let pkg_file = cpu_root.join(format!(
                "cpu{}/topology/physical_package_id",
                core_socket_map.len()
            ));
            if !pkg_file.is_file() {
                break;
            }
            let pkg = fs::read_to_string(&pkg_file)
                .with_context(|| format!("reading {}", pkg_file.display()))?
                .trim()
                .parse::<usize>()
                .with_context(|| format!("parsing {}", pkg_file.display()))?;
            core_socket_map.push(pkg);
        }

        if core_socket_map.is_empty() {
            anyhow::bail!("no cpu*/topology entries under {}", cpu_root.display());
        }

        let num_sockets = core_socket_map.iter().max().copied().unwrap_or(0) + 1;

        Ok(Self {
            core_socket_map,
            num_sockets,
            clock_tick_hz: clock_tick_rate(),
            page_size_bytes: page_size(),
        })
    }

    /// Socket executing the given logical core, if the core is known
    pub fn socket_of(&self, core: usize) -> Option<usize> {
        self.core_socket_map.get(core).copied()
    }

    pub fn num_sockets(&self) -> usize {
        self.num_sockets
    }

    pub fn num_cores(&self) -> usize {
        self.core_socket_map.len()
    }

    /// Jiffies per second (USER_HZ)
    pub fn clock_tick_hz(&self) -> f64 {
        self.clock_tick_hz
    }

    pub fn page_size_bytes(&self) -> u64 {
        self.page_size_bytes
    }

    /// Per-socket zeroed accumulator, the shape most of the pipeline works in
    pub fn zeroed(&self) -> Vec<f64> {
        vec![0.0; self.num_sockets]
    }
}

fn clock_tick_rate() -> f64 {
    // SAFETY: sysconf takes no pointers and only reads static system limits.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as f64
    } else {
        DEFAULT_CLK_TCK
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf takes no pointers and only reads static system limits.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

/// Path of the per-cpu package id file, shared with tests building fake trees
pub fn package_id_path(cpu_root: &Path, core: usize) -> PathBuf {
    cpu_root.join(format!("cpu{}/topology/physical_package_id", core))
}
