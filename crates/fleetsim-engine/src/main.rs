//! Command-line front end: build a synthetic fleet, run it, report.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;

use fleetsim_engine::{
    ComputeScheduler, FailureModel, FleetService, HostId, HostSpec, PowerModel, Sampler,
    SchedulerStats, ServiceTask, SimError, SimTime, TaskId, WorkloadSpec,
};
use fleetsim_engine::scheduler::{RamFilter, RamWeigher, VCpuFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FailureKind {
    None,
    Uncorrelated,
    Correlated,
}

/// Simulate a homogeneous host fleet under a synthetic task load.
#[derive(Debug, Parser)]
#[command(name = "fleetsim", version)]
struct Args {
    /// Number of hosts in the fleet.
    #[arg(long, default_value_t = 8)]
    hosts: u64,

    /// vCPUs per host.
    #[arg(long, default_value_t = 8)]
    host_cpus: u32,

    /// Capacity of one vCPU, in units per second.
    #[arg(long, default_value_t = 3200.0)]
    cpu_speed: f64,

    /// Memory per host, in MiB.
    #[arg(long, default_value_t = 65536)]
    host_memory: u64,

    /// Number of tasks to submit at the start of the run.
    #[arg(long, default_value_t = 32)]
    tasks: u64,

    /// vCPUs requested per task.
    #[arg(long, default_value_t = 2)]
    task_cpus: u32,

    /// Memory requested per task, in MiB.
    #[arg(long, default_value_t = 4096)]
    task_memory: u64,

    /// Mean work per task, in CPU units. Per-task amounts are drawn
    /// uniformly from [0.5x, 1.5x) of this value.
    #[arg(long, default_value_t = 3_600_000.0)]
    task_work: f64,

    /// Task CPU utilization ratio, in (0, 1].
    #[arg(long, default_value_t = 0.8)]
    task_utilization: f64,

    /// Memory overcommit ratio for placement.
    #[arg(long, default_value_t = 1.0)]
    ram_allocation_ratio: f64,

    /// vCPU overcommit ratio for placement.
    #[arg(long, default_value_t = 4.0)]
    vcpu_allocation_ratio: f64,

    /// Failure model to install.
    #[arg(long, value_enum, default_value_t = FailureKind::None)]
    failures: FailureKind,

    /// Mean time between failures, in milliseconds.
    #[arg(long, default_value_t = 86_400_000.0)]
    fault_interarrival: f64,

    /// Mean failure duration, in milliseconds.
    #[arg(long, default_value_t = 3_600_000.0)]
    fault_duration: f64,

    /// Mean group size for correlated failures.
    #[arg(long, default_value_t = 2.0)]
    fault_group_size: f64,

    /// Seed for all stochastic behavior.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Simulated run length, in milliseconds.
    #[arg(long, default_value_t = 604_800_000)]
    duration: SimTime,

    /// Emit the report as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Also write the JSON report to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Report {
    simulated_ms: SimTime,
    stats: SchedulerStats,
    power_draw_w: f64,
    fault_rounds: usize,
}

fn build_topology(args: &Args) -> Vec<HostSpec> {
    (0..args.hosts)
        .map(|i| HostSpec {
            id: HostId(i),
            name: format!("node-{i:03}"),
            cluster_tag: format!("rack-{}", i / 16),
            cpu_count: args.host_cpus,
            cpu_speed: args.cpu_speed,
            memory_capacity: args.host_memory,
            power_model: PowerModel::Linear {
                idle: 150.0,
                max: 400.0,
            },
        })
        .collect()
}

fn build_failure_model(args: &Args) -> Result<Option<FailureModel>, SimError> {
    let model = match args.failures {
        FailureKind::None => return Ok(None),
        FailureKind::Uncorrelated => FailureModel::Uncorrelated {
            interarrival: Sampler::exponential(args.fault_interarrival)?,
            duration: Sampler::exponential(args.fault_duration)?,
            seed: args.seed,
        },
        FailureKind::Correlated => FailureModel::Correlated {
            interarrival: Sampler::exponential(args.fault_interarrival)?,
            duration: Sampler::exponential(args.fault_duration)?,
            group_size: Sampler::constant(args.fault_group_size)?,
            seed: args.seed,
        },
    };
    Ok(Some(model))
}

fn run(args: &Args) -> Result<Report, SimError> {
    let scheduler = ComputeScheduler::new()
        .with_filter(Box::new(RamFilter::new(args.ram_allocation_ratio)?))
        .with_filter(Box::new(VCpuFilter::new(args.vcpu_allocation_ratio)?))
        .with_weigher(Box::new(RamWeigher { multiplier: 1.0 }));

    let mut fleet = FleetService::new(build_topology(args), scheduler)?;
    if let Some(model) = build_failure_model(args)? {
        fleet.install_injector(model)?;
    }
    let work = Sampler::uniform(args.task_work * 0.5, args.task_work * 1.5)?;
    let mut rng = ChaCha20Rng::seed_from_u64(args.seed);
    for i in 0..args.tasks {
        fleet.submit(
            ServiceTask {
                id: TaskId(i),
                name: format!("task-{i:04}"),
                cpu_count: args.task_cpus,
                memory: args.task_memory,
                workload: WorkloadSpec::Fixed {
                    amount: work.sample(&mut rng),
                    utilization: args.task_utilization,
                },
            },
            0,
        )?;
    }

    fleet.run_until(args.duration)?;
    let report = Report {
        simulated_ms: fleet.now(),
        stats: fleet.stats(),
        power_draw_w: fleet.power_draw(),
        fault_rounds: fleet
            .fault_timeline()
            .map(|t| t.borrow().rounds.len())
            .unwrap_or(0),
    };
    fleet.close();
    Ok(report)
}

fn print_report(report: &Report, args: &Args) -> Result<(), SimError> {
    if args.json || args.output.is_some() {
        let rendered = serde_json::to_string_pretty(report)
            .map_err(|e| SimError::Process(format!("report serialization failed: {e}")))?;
        if let Some(path) = &args.output {
            fs::write(path, &rendered)
                .map_err(|e| SimError::Process(format!("writing {}: {e}", path.display())))?;
        }
        if args.json {
            println!("{rendered}");
            return Ok(());
        }
    }
    let stats = &report.stats;
    println!("simulated          {} ms", report.simulated_ms);
    println!(
        "hosts              {} up / {} down",
        stats.hosts_available, stats.hosts_unavailable
    );
    println!(
        "tasks              {} total: {} completed, {} terminated, {} active, {} pending",
        stats.tasks_total,
        stats.tasks_completed,
        stats.tasks_terminated,
        stats.tasks_active,
        stats.tasks_pending
    );
    println!(
        "placements         {} succeeded, {} deferred",
        stats.attempts_success, stats.attempts_failure
    );
    println!("fault rounds       {}", report.fault_rounds);
    println!("power draw         {:.1} W", report.power_draw_w);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let result = run(&args).and_then(|report| print_report(&report, &args));
    if let Err(err) = result {
        tracing::error!(error = %err, "simulation failed");
        std::process::exit(1);
    }
}
