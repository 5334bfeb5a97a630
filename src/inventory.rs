//! Target thread inventory
//!
//! Enumerates the live threads of the target process from its task
//! directory and reads, per thread, cumulative CPU time and the core it
//! last executed on. Process-level NUMA residency comes from `numa_maps`
//! once per sample, since threads share the address space.
//!
//! The inventory keeps a previous-CPU-time map across samples so deltas
//! can be computed; a thread observed for the first time contributes
//! nothing in its introducing sample.

use crate::topology::Topology;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One live thread of the target at a sample boundary
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub tid: i32,
    /// Socket the thread last executed on; None when the core could not be
    /// mapped (the thread is dropped from that sample's numerator)
    pub socket: Option<usize>,
    pub cpu_time_s: f64,
}

/// Aggregated inventory results for one attribution interval
#[derive(Debug, Clone)]
pub struct InventorySample {
    /// Per-socket CPU seconds consumed by target threads this interval
    pub cpu_time_delta_per_socket: Vec<f64>,
    /// Live target threads currently assigned to each socket
    pub threads_per_socket: Vec<u32>,
    /// Process resident memory per NUMA node in MiB
    pub residency_mib: Vec<f64>,
    pub num_threads: usize,
}

/// Stateful per-target inventory
#[derive(Debug)]
pub struct ThreadInventory {
    proc_root: PathBuf,
    pid: i32,
    prev_cpu_time: HashMap<i32, f64>,
}

impl ThreadInventory {
    pub fn new(pid: i32) -> Self {
        Self::with_proc_root(pid, PathBuf::from("/proc"))
    }

    /// Inventory over an arbitrary proc root (tests use a tempdir)
    pub fn with_proc_root(pid: i32, proc_root: PathBuf) -> Self {
        Self {
            proc_root,
            pid,
            prev_cpu_time: HashMap::new(),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The innermost stat file also serves as the liveness check: it exists
    /// exactly as long as the main thread does
    pub fn target_alive(&self) -> bool {
        self.proc_root
            .join(format!("{0}/task/{0}/stat", self.pid))
            .is_file()
    }

    /// Enumerate live threads, compute per-socket CPU deltas against the
    /// retained baselines, and read process NUMA residency
    pub fn collect(&mut self, topo: &Topology) -> Result<InventorySample> {
        let task_dir = self.proc_root.join(format!("{}/task", self.pid));
        let entries = fs::read_dir(&task_dir)
            .with_context(|| format!("enumerating {}", task_dir.display()))?;

        let mut cpu_time_delta_per_socket = topo.zeroed();
        let mut threads_per_socket = vec![0u32; topo.num_sockets()];
        let mut next_prev = HashMap::new();
        let mut num_threads = 0usize;

        for entry in entries.flatten() {
            let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };

            match self.read_thread(tid, topo) {
                Ok(record) => {
                    num_threads += 1;
                    let prev = self
                        .prev_cpu_time
                        .get(&tid)
                        .copied()
                        .unwrap_or(record.cpu_time_s);
                    let delta = (record.cpu_time_s - prev).max(0.0);
                    next_prev.insert(tid, record.cpu_time_s);

                    match record.socket {
                        Some(socket) => {
                            cpu_time_delta_per_socket[socket] += delta;
                            threads_per_socket[socket] += 1;
                        }
                        None => debug!(tid, "thread socket unknown, dropped this sample"),
                    }
                }
                Err(e) => {
                    // Exited between enumeration and read. Keep its baseline
                    // so a reappearing TID is not double-counted.
                    debug!(tid, error = %e, "thread vanished mid-inventory");
                    if let Some(prev) = self.prev_cpu_time.get(&tid) {
                        next_prev.insert(tid, *prev);
                    }
                }
            }
        }

        self.prev_cpu_time = next_prev;

        let residency_mib = match self.read_numa_residency_mib(topo) {
            Ok(mem) => mem,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "numa_maps read failed, residency zeroed");
                topo.zeroed()
            }
        };

        Ok(InventorySample {
            cpu_time_delta_per_socket,
            threads_per_socket,
            residency_mib,
            num_threads,
        })
    }

    fn read_thread(&self, tid: i32, topo: &Topology) -> Result<ThreadRecord> {
        let stat_path = self
            .proc_root
            .join(format!("{}/task/{}/stat", self.pid, tid));
        let raw =
            fs::read_to_string(&stat_path).with_context(|| format!("{}", stat_path.display()))?;
        let (cpu_time_ticks, core) = parse_stat_line(&raw)
            .with_context(|| format!("malformed stat for tid {}", tid))?;

        Ok(ThreadRecord {
            tid,
            socket: topo.socket_of(core),
            cpu_time_s: cpu_time_ticks as f64 / topo.clock_tick_hz(),
        })
    }

    /// Process-level resident pages per NUMA node from numa_maps, in MiB
    fn read_numa_residency_mib(&self, topo: &Topology) -> Result<Vec<f64>> {
        let path = self.proc_root.join(format!("{}/numa_maps", self.pid));
        let raw = fs::read_to_string(&path).with_context(|| format!("{}", path.display()))?;
        Ok(parse_numa_maps_mib(
            &raw,
            topo.num_sockets(),
            topo.page_size_bytes(),
        ))
    }
}

/// Extract (utime+stime jiffies, last processor) from a task stat line.
/// The comm field is parenthesized and may contain spaces, so fields are
/// counted from the last closing parenthesis.
fn parse_stat_line(raw: &str) -> Option<(u64, usize)> {
    let after_comm = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Fields 14 (utime), 15 (stime) and 39 (processor), 1-indexed over the
    // whole line; the slice starts at field 3.
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    let processor = fields.get(36)?.parse::<usize>().ok()?;
    Some((utime + stime, processor))
}

/// Sum `N<node>=<pages>` entries of a numa_maps dump into MiB per node.
/// Lines carry their own page size when hugepages are mapped.
fn parse_numa_maps_mib(raw: &str, num_sockets: usize, default_page_bytes: u64) -> Vec<f64> {
    let mut bytes_per_node = vec![0u64; num_sockets];
    for line in raw.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let page_bytes = tokens
            .iter()
            .find_map(|t| t.strip_prefix("kernelpagesize_kB="))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(default_page_bytes);

        for token in &tokens {
            let Some(rest) = token.strip_prefix('N') else {
                continue;
            };
            let Some((node, pages)) = rest.split_once('=') else {
                continue;
            };
            let (Ok(node), Ok(pages)) = (node.parse::<usize>(), pages.parse::<u64>()) else {
                continue;
            };
            if node < num_sockets {
                bytes_per_node[node] += pages * page_bytes;
            }
        }
    }
    bytes_per_node
        .into_iter()
        .map(|b| b as f64 / (1024.0 * 1024.0))
        .collect()
}

/// Resolve a PID by exact match against `/proc/<pid>/comm`
pub fn find_pid_by_name(proc_root: &Path, name: &str) -> Result<i32> {
    let mut matches = Vec::new();
    for entry in fs::read_dir(proc_root)
        .with_context(|| format!("enumerating {}", proc_root.display()))?
        .flatten()
    {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim() == name {
            matches.push(pid);
        }
    }

    match matches.as_slice() {
        [pid] => Ok(*pid),
        [] => anyhow::bail!("no process named {:?}", name),
        many => anyhow::bail!("{} processes named {:?}: {:?}", many.len(), name, many),
    }
}
