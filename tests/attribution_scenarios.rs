//! End-to-end attribution scenarios
//!
//! Each test replays one of the canonical multi-tenant situations against
//! the public pipeline API, with synthetic sysfs and procfs trees standing
//! in for the hardware.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use vatio::attribution::{attribute, IntervalInput, ScalingFactors};
use vatio::baseline::BaselinePower;
use vatio::inventory::ThreadInventory;
use vatio::probe::SystemProbe;
use vatio::rapl::{DomainKind, DomainReading, RaplReader};
use vatio::sampler::{Sampler, SamplerConfig};
use vatio::topology::{self, Topology};
use vatio::trace_sink::TraceSink;

fn two_socket_input(
    dt_s: f64,
    host_pkg_j: [f64; 2],
    host_cpu_s: [f64; 2],
    target_cpu_s: [f64; 2],
    threads: [u32; 2],
) -> IntervalInput {
    IntervalInput {
        dt_s,
        host_pkg_delta_j: host_pkg_j.iter().map(|j| DomainReading::Joules(*j)).collect(),
        host_dram_delta_j: vec![DomainReading::Unsupported; 2],
        host_cpu_time_delta_s: host_cpu_s.to_vec(),
        host_numa_mem_mib: vec![8192.0; 2],
        target_cpu_time_delta_s: target_cpu_s.to_vec(),
        target_mem_mib: vec![0.0; 2],
        threads_per_socket: threads.to_vec(),
    }
}

#[test]
fn test_scenario_idle_host_idle_target() {
    // Host draws 60 J over 1 s against a 55 W baseline; the target threads
    // accrue no CPU time, so nothing is credited.
    let input = two_socket_input(1.0, [60.0, 60.0], [0.02, 0.02], [0.0, 0.0], [2, 0]);
    let baseline = BaselinePower {
        pkg_watts: vec![55.0, 55.0],
        dram_watts: vec![0.0, 0.0],
    };

    let rows = attribute(&input, &baseline, ScalingFactors::default()).unwrap();
    for row in &rows {
        assert!((row.cpu_share - 0.0).abs() < 1e-12);
        assert!((row.target_cpu_j - 0.0).abs() < 1e-12);
    }
}

#[test]
fn test_scenario_single_tenant_owns_the_socket() {
    // Target consumes all of socket 0's CPU time for 2 s; 80 J measured,
    // 10 W baseline: 60 J active, all of it credited.
    let input = two_socket_input(2.0, [80.0, 30.0], [2.0, 1.0], [2.0, 0.0], [8, 0]);
    let baseline = BaselinePower {
        pkg_watts: vec![10.0, 10.0],
        dram_watts: vec![0.0, 0.0],
    };

    let rows = attribute(&input, &baseline, ScalingFactors::default()).unwrap();
    assert!((rows[0].cpu_share - 1.0).abs() < 1e-9);
    assert!((rows[0].target_cpu_j - 60.0).abs() < 0.5);
    assert!((rows[1].cpu_share - 0.0).abs() < 1e-12);
    assert!((rows[1].target_cpu_j - 0.0).abs() < 1e-12);
}

#[test]
fn test_scenario_cotenant_power_law_uplift() {
    // 30% of socket 0's CPU time, 100 J over 1 s, 10 W baseline, gamma 0.3:
    // credited share is 0.3^0.3 of the 90 J active energy.
    let input = two_socket_input(1.0, [100.0, 10.0], [1.0, 1.0], [0.3, 0.0], [3, 0]);
    let baseline = BaselinePower {
        pkg_watts: vec![10.0, 10.0],
        dram_watts: vec![0.0, 0.0],
    };

    let rows = attribute(&input, &baseline, ScalingFactors::default()).unwrap();
    let share = 0.3f64.powf(0.3);
    assert!((rows[0].cpu_share - share).abs() < 1e-9);
    assert!((rows[0].target_cpu_j - share * 90.0).abs() < 0.1);
    assert!((rows[0].target_cpu_j - 62.7).abs() < 0.2);
}

#[test]
fn test_scenario_counter_wrap_yields_true_delta() {
    let max_range_uj = 262_143_328_850u64;
    let root = TempDir::new().unwrap();
    let pkg = root.path().join("intel-rapl:0");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("name"), "package-0\n").unwrap();
    fs::write(
        pkg.join("max_energy_range_uj"),
        format!("{}\n", max_range_uj),
    )
    .unwrap();
    fs::write(
        pkg.join("energy_uj"),
        format!("{}\n", max_range_uj - 10_000_000),
    )
    .unwrap();

    let mut reader = RaplReader::open_at(root.path(), 1).unwrap();
    fs::write(pkg.join("energy_uj"), "5000000\n").unwrap();
    reader.poll();

    match reader.accumulated(0, DomainKind::Package) {
        DomainReading::Joules(j) => assert!((j - 15.0).abs() < 1e-9),
        DomainReading::Unsupported => panic!("package domain must be supported"),
    }
}

/// Synthetic single-socket host with a fake target process
struct FakeHost {
    dir: TempDir,
    topology: Topology,
}

impl FakeHost {
    fn new(pid: i32) -> Self {
        let dir = TempDir::new().unwrap();

        let cpu_root = dir.path().join("cpu");
        for core in 0..2 {
            let pkg_file = topology::package_id_path(&cpu_root, core);
            fs::create_dir_all(pkg_file.parent().unwrap()).unwrap();
            fs::write(&pkg_file, "0\n").unwrap();
        }
        let topo = Topology::discover_at(&cpu_root).unwrap();

        let pkg = dir.path().join("powercap/intel-rapl:0");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("name"), "package-0\n").unwrap();
        fs::write(pkg.join("energy_uj"), "1000000\n").unwrap();
        fs::write(pkg.join("max_energy_range_uj"), "262143328850\n").unwrap();

        fs::write(
            dir.path().join("stat"),
            "cpu0 100 0 0 1000 0 0 0 0 0 0\ncpu1 100 0 0 1000 0 0 0 0 0 0\n",
        )
        .unwrap();

        let node0 = dir.path().join("node/node0");
        fs::create_dir_all(&node0).unwrap();
        fs::write(
            node0.join("meminfo"),
            "Node 0 MemTotal:       4194304 kB\n\
             Node 0 MemFree:        2097152 kB\n\
             Node 0 MemUsed:        2097152 kB\n",
        )
        .unwrap();

        let task = dir.path().join(format!("proc/{0}/task/{0}", pid));
        fs::create_dir_all(&task).unwrap();
        let mut stat = format!("{} (fake_target) S", pid);
        for _ in 4..=52 {
            stat.push_str(" 0");
        }
        fs::write(task.join("stat"), stat).unwrap();
        fs::write(dir.path().join(format!("proc/{}/numa_maps", pid)), "").unwrap();

        Self {
            dir,
            topology: topo,
        }
    }

    fn trace_path(&self) -> PathBuf {
        self.dir.path().join("trace.csv")
    }

    fn main_thread_stat(&self, pid: i32) -> PathBuf {
        self.dir.path().join(format!("proc/{0}/task/{0}/stat", pid))
    }

    fn sampler(&self, pid: i32, stop: Arc<AtomicBool>) -> Sampler {
        let rapl = RaplReader::open_at(&self.dir.path().join("powercap"), 1).unwrap();
        let probe = SystemProbe::with_roots(
            self.dir.path().join("stat"),
            self.dir.path().join("node"),
        );
        let inventory = ThreadInventory::with_proc_root(pid, self.dir.path().join("proc"));
        let sink = TraceSink::create(&self.trace_path(), 1).unwrap();
        Sampler::new(
            SamplerConfig {
                interval: Duration::from_millis(50),
                rapl_period: Duration::from_millis(5),
                factors: ScalingFactors::default(),
            },
            self.topology.clone(),
            rapl,
            probe,
            inventory,
            BaselinePower::zero(1),
            sink,
            stop,
        )
    }
}

fn read_trace(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_scenario_missing_dram_emits_nan_columns() {
    let host = FakeHost::new(900);
    let stop = Arc::new(AtomicBool::new(false));
    let stopper = stop.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(130));
        stopper.store(true, Ordering::Relaxed);
    });

    let mut sampler = host.sampler(900, stop);
    let summary = sampler.run().unwrap();
    assert!(summary.rows_written >= 1);

    let lines = read_trace(&host.trace_path());
    let header: Vec<&str> = lines[0].split(',').collect();
    let row: Vec<&str> = lines[1].split(',').collect();

    let col = |name: &str| header.iter().position(|h| *h == name).unwrap();
    assert_eq!(row[col("host_dram_j_s0")], "NaN");
    assert_eq!(row[col("target_dram_j_s0")], "NaN");
    assert_eq!(row[col("dram_share_s0")], "NaN");
    // CPU columns stay numeric.
    assert!(row[col("host_cpu_j_s0")].parse::<f64>().is_ok());
    assert!(row[col("cpu_share_s0")].parse::<f64>().is_ok());
}

#[test]
fn test_scenario_target_exit_mid_run_keeps_trace() {
    let host = FakeHost::new(901);
    let stat = host.main_thread_stat(901);
    let stop = Arc::new(AtomicBool::new(false));

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(130));
        let _ = fs::remove_file(stat);
    });

    let mut sampler = host.sampler(901, stop);
    let summary = sampler.run().unwrap();
    killer.join().unwrap();

    // Rows emitted before the exit survive, and no trailing row of NaN
    // values is appended for the partial interval.
    assert!(summary.rows_written >= 1);
    let lines = read_trace(&host.trace_path());
    assert_eq!(lines.len() as u64, summary.rows_written + 1);
    for row in &lines[1..] {
        assert!(row.split(',').nth(4).unwrap().parse::<f64>().is_ok());
    }
}

#[test]
fn test_scenario_interrupt_flushes_trace() {
    let host = FakeHost::new(902);
    let stop = Arc::new(AtomicBool::new(false));
    let stopper = stop.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(130));
        stopper.store(true, Ordering::Relaxed);
    });

    let mut sampler = host.sampler(902, stop);
    let summary = sampler.run().unwrap();

    // The trace so far is durable on disk after the signal.
    let lines = read_trace(&host.trace_path());
    assert!(lines[0].starts_with("timestamp_iso8601"));
    assert_eq!(lines.len() as u64, summary.rows_written + 1);
}

#[test]
fn test_scenario_trace_timestamps_strictly_increase() {
    let host = FakeHost::new(903);
    let stop = Arc::new(AtomicBool::new(false));
    let stopper = stop.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(220));
        stopper.store(true, Ordering::Relaxed);
    });

    let mut sampler = host.sampler(903, stop);
    let summary = sampler.run().unwrap();
    assert!(summary.rows_written >= 2);

    let lines = read_trace(&host.trace_path());
    let timestamps: Vec<&str> = lines[1..]
        .iter()
        .map(|l| l.split(',').next().unwrap())
        .collect();
    for pair in timestamps.windows(2) {
        assert!(pair[1] > pair[0], "{} !> {}", pair[1], pair[0]);
    }
}
