use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use vatio::attribution::ScalingFactors;
use vatio::baseline::BaselinePower;
use vatio::cli::{Cli, LogLevel};
use vatio::error::TracerError;
use vatio::inventory::{self, ThreadInventory};
use vatio::probe::{MemField, SystemProbe};
use vatio::rapl::{DomainKind, RaplReader};
use vatio::sampler::{Sampler, SamplerConfig};
use vatio::topology::Topology;
use vatio::trace_sink::TraceSink;

fn main() {
    // Usage mistakes are configuration failures (exit 1); help and version
    // keep clap's zero exit.
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            process::exit(1);
        }
    };
    init_logging(args.loglvl);

    if let Err(e) = run(args) {
        error!("{:#}", e);
        let code = e
            .downcast_ref::<TracerError>()
            .map(TracerError::exit_code)
            .unwrap_or(1);
        process::exit(code);
    }
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level.as_filter()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Cli) -> Result<()> {
    args.validate().map_err(TracerError::Config)?;

    if args.check {
        let topology = Topology::discover().context("discovering CPU topology")?;
        return run_check(&args, &topology);
    }

    if args.basepower {
        let topology = Topology::discover().context("discovering CPU topology")?;
        let mut rapl = RaplReader::open(topology.num_sockets())?;
        info!(
            window_s = args.base_period,
            "estimating baseline power over a quiet window"
        );
        let baseline =
            BaselinePower::estimate(&mut rapl, Duration::from_secs_f64(args.base_period));
        baseline.save(Path::new(&args.basefile))?;
        return Ok(());
    }

    // Target resolution needs no hardware, so bad invocations fail before
    // any sysfs access.
    let pid = resolve_target(&args)?;
    info!(pid, "attaching to target");

    let topology = Topology::discover().context("discovering CPU topology")?;
    let rapl = RaplReader::open(topology.num_sockets())?;

    let baseline = BaselinePower::load(Path::new(&args.basefile), topology.num_sockets())?;
    let inventory = ThreadInventory::new(pid);
    let sink = TraceSink::create(Path::new(&args.output), topology.num_sockets())?;
    let probe = SystemProbe::new();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("installing signal handler")?;

    let config = SamplerConfig {
        interval: Duration::from_secs_f64(args.interval),
        rapl_period: Duration::from_secs_f64(args.rapl_period),
        factors: ScalingFactors {
            gamma: args.gamma,
            delta: args.delta,
        },
    };

    let mut sampler = Sampler::new(
        config, topology, rapl, probe, inventory, baseline, sink, stop,
    );
    let summary = sampler.run()?;
    info!(
        rows = summary.rows_written,
        output = %args.output,
        "energy trace saved"
    );
    Ok(())
}

/// Topology, permission and hardware probe behind `--check`
fn run_check(args: &Cli, topology: &Topology) -> Result<()> {
    info!(
        sockets = topology.num_sockets(),
        cores = topology.num_cores(),
        "cpu topology"
    );

    let rapl = RaplReader::open(topology.num_sockets())?;
    for socket in 0..topology.num_sockets() {
        info!(
            socket,
            pkg_range_j = ?rapl.max_range_j(socket, DomainKind::Package),
            dram_range_j = ?rapl.max_range_j(socket, DomainKind::Dram),
            "rapl domain ranges"
        );
    }

    let probe = SystemProbe::new();
    let cpu_times = probe.cpu_time_per_socket(topology)?;
    let numa_total = probe.numa_mem_mib(topology.num_sockets(), MemField::Total)?;
    info!(?cpu_times, "host cpu seconds per socket");
    info!(?numa_total, "total NUMA memory per node (MiB)");

    // Unused at probe time, but surfaces a malformed file before a run does.
    let _ = BaselinePower::load(Path::new(&args.basefile), topology.num_sockets())?;

    info!("system check passed");
    Ok(())
}

fn resolve_target(args: &Cli) -> Result<i32> {
    match (args.pid, args.name.as_deref()) {
        (Some(pid), _) => Ok(pid),
        (None, Some(name)) => inventory::find_pid_by_name(Path::new("/proc"), name)
            .map_err(|e| TracerError::Config(format!("{:#}", e)).into()),
        (None, None) => {
            Err(TracerError::Config("no target: pass --pid or --name".to_string()).into())
        }
    }
}
