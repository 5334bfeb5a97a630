//! RAPL energy counters via the powercap sysfs tree
//!
//! Each socket exposes a cumulative microjoule counter for its package
//! domain and, when the hardware supports it, a DRAM subdomain. Counters
//! wrap at `max_energy_range_uj`; this reader keeps a wrap-corrected
//! monotonic accumulator per domain so callers can take deltas over
//! arbitrary intervals.

use crate::error::TracerError;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default powercap sysfs root
pub const DEFAULT_POWERCAP_ROOT: &str = "/sys/class/powercap";

/// Measurable energy region of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Package,
    Dram,
}

/// A domain reading: joules, or a sentinel for hardware without the domain
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DomainReading {
    Joules(f64),
    Unsupported,
}

impl DomainReading {
    pub fn is_supported(&self) -> bool {
        matches!(self, DomainReading::Joules(_))
    }

    /// Joules, with unsupported domains collapsing to the fallback
    pub fn joules_or(self, fallback: f64) -> f64 {
        match self {
            DomainReading::Joules(j) => j,
            DomainReading::Unsupported => fallback,
        }
    }

    /// Delta between two readings of the same domain
    pub fn delta_since(self, earlier: DomainReading) -> DomainReading {
        match (self, earlier) {
            (DomainReading::Joules(now), DomainReading::Joules(then)) => {
                DomainReading::Joules(now - then)
            }
            _ => DomainReading::Unsupported,
        }
    }
}

/// One powercap domain: the held counter descriptor, wrap point, and the
/// running accumulator. The descriptor is opened once and released by drop
/// on every exit path.
#[derive(Debug)]
struct DomainCounter {
    energy_file: File,
    max_range_uj: u64,
    last_uj: u64,
    accumulated_j: f64,
}

impl DomainCounter {
    /// Open a domain directory and prime the accumulator with the current
    /// raw counter value
    fn open(dir: &Path) -> io::Result<Self> {
        let max_range_uj = read_u64(&dir.join("max_energy_range_uj"))?;
        let mut energy_file = File::open(dir.join("energy_uj"))?;
        let last_uj = read_counter(&mut energy_file)?;
        Ok(Self {
            energy_file,
            max_range_uj,
            last_uj,
            accumulated_j: 0.0,
        })
    }

    /// Read the raw counter and fold the delta into the accumulator.
    /// A raw value below the previous one means the counter wrapped.
    fn poll(&mut self) -> io::Result<()> {
        let now_uj = read_counter(&mut self.energy_file)?;
        let delta_uj = if now_uj >= self.last_uj {
            now_uj - self.last_uj
        } else {
            (self.max_range_uj - self.last_uj) + now_uj
        };
        self.accumulated_j += delta_uj as f64 / 1e6;
        self.last_uj = now_uj;
        Ok(())
    }
}

/// Rewind the held descriptor and re-read the microjoule counter
fn read_counter(file: &mut File) -> io::Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Wrap-corrected reader over all sockets' package and DRAM domains
#[derive(Debug)]
pub struct RaplReader {
    packages: Vec<DomainCounter>,
    drams: Vec<Option<DomainCounter>>,
    dram_max_ranges_j: Vec<Option<f64>>,
}

impl RaplReader {
    /// Open the live powercap tree
    pub fn open(num_sockets: usize) -> Result<Self, TracerError> {
        Self::open_at(Path::new(DEFAULT_POWERCAP_ROOT), num_sockets)
    }

    /// Open a powercap tree at an arbitrary root (tests use a tempdir)
    pub fn open_at(root: &Path, num_sockets: usize) -> Result<Self, TracerError> {
        let mut packages = Vec::with_capacity(num_sockets);
        let mut drams = Vec::with_capacity(num_sockets);
        let mut dram_max_ranges_j = Vec::with_capacity(num_sockets);

        for socket in 0..num_sockets {
            let pkg_dir = root.join(format!("intel-rapl:{}", socket));
            if !pkg_dir.is_dir() {
                return Err(TracerError::UnsupportedHardware {
                    root: root.to_path_buf(),
                });
            }

            let name = fs::read_to_string(pkg_dir.join("name"))
                .map_err(|e| map_open_error(e, &pkg_dir, root))?;
            if name.trim() != format!("package-{}", socket) {
                warn!(
                    socket,
                    domain = name.trim(),
                    "unexpected powercap domain name, expected package"
                );
            }

            let package =
                DomainCounter::open(&pkg_dir).map_err(|e| map_open_error(e, &pkg_dir, root))?;
            debug!(
                socket,
                max_range_j = package.max_range_uj as f64 / 1e6,
                "opened package domain"
            );

            let dram = match find_dram_subdomain(&pkg_dir, socket) {
                Some(dram_dir) => {
                    let counter = DomainCounter::open(&dram_dir)
                        .map_err(|e| map_open_error(e, &dram_dir, root))?;
                    debug!(socket, "opened dram subdomain");
                    Some(counter)
                }
                None => {
                    warn!(socket, "no dram subdomain; DRAM columns will be NaN");
                    None
                }
            };

            dram_max_ranges_j.push(dram.as_ref().map(|d| d.max_range_uj as f64 / 1e6));
            packages.push(package);
            drams.push(dram);
        }

        Ok(Self {
            packages,
            drams,
            dram_max_ranges_j,
        })
    }

    /// Poll every domain once, folding new deltas into the accumulators.
    /// Transient read failures leave the prior accumulated value in place;
    /// the next successful read absorbs the missed interval.
    pub fn poll(&mut self) {
        for (socket, pkg) in self.packages.iter_mut().enumerate() {
            if let Err(e) = pkg.poll() {
                warn!(socket, error = %e, "package energy read failed, keeping prior value");
            }
        }
        for (socket, dram) in self.drams.iter_mut().enumerate() {
            if let Some(dram) = dram {
                if let Err(e) = dram.poll() {
                    warn!(socket, error = %e, "dram energy read failed, keeping prior value");
                }
            }
        }
    }

    /// Wrap-corrected cumulative joules since the reader was opened
    pub fn accumulated(&self, socket: usize, kind: DomainKind) -> DomainReading {
        match kind {
            DomainKind::Package => self
                .packages
                .get(socket)
                .map(|c| DomainReading::Joules(c.accumulated_j))
                .unwrap_or(DomainReading::Unsupported),
            DomainKind::Dram => self
                .drams
                .get(socket)
                .and_then(|c| c.as_ref())
                .map(|c| DomainReading::Joules(c.accumulated_j))
                .unwrap_or(DomainReading::Unsupported),
        }
    }

    /// Counter wrap point in joules
    pub fn max_range_j(&self, socket: usize, kind: DomainKind) -> DomainReading {
        match kind {
            DomainKind::Package => self
                .packages
                .get(socket)
                .map(|c| DomainReading::Joules(c.max_range_uj as f64 / 1e6))
                .unwrap_or(DomainReading::Unsupported),
            DomainKind::Dram => self
                .dram_max_ranges_j
                .get(socket)
                .and_then(|r| *r)
                .map(DomainReading::Joules)
                .unwrap_or(DomainReading::Unsupported),
        }
    }

    pub fn num_sockets(&self) -> usize {
        self.packages.len()
    }
}

/// Scan `intel-rapl:{socket}:*` subdirectories for the one named "dram"
fn find_dram_subdomain(pkg_dir: &Path, socket: usize) -> Option<PathBuf> {
    for sub in 0..8 {
        let dir = pkg_dir.join(format!("intel-rapl:{}:{}", socket, sub));
        if !dir.is_dir() {
            break;
        }
        match fs::read_to_string(dir.join("name")) {
            Ok(name) if name.trim() == "dram" => return Some(dir),
            _ => continue,
        }
    }
    None
}

fn read_u64(path: &Path) -> io::Result<u64> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn map_open_error(e: io::Error, path: &Path, root: &Path) -> TracerError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => TracerError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => TracerError::UnsupportedHardware {
            root: root.to_path_buf(),
        },
    }
}
