//! GVM CLI entrypoint.
//!
//! ```bash
//! gvm probe --json
//! gvm config
//! gvm simulate --threads 8 --launches 20000 --mode per_call --json
//! ```

use std::io::IsTerminal;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use gvm_core::MIB;
use gvm_core::arbiter::{Arbiter, ArbiterLocator, LogArbiter};
use gvm_core::config::{InterceptConfig, parse_tracking_mode};
use gvm_core::driver::{DeviceIdentity, KernelLaunch, StreamHandle};
use gvm_core::error::{InterceptError, Result};
use gvm_cuda::{CudaDriver, DriverProbe};
use gvm_intercept::Interceptor;
use gvm_intercept::sim::SimDriver;

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "gvm",
    version,
    about = "GPU driver interposer diagnostics",
    arg_required_else_help = true,
    after_help = "Examples:\n  gvm probe --json\n  gvm config --json\n  gvm simulate --threads 4 --launches 10000 --mode sampled --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the real driver and report version, devices and exported entry points.
    Probe(ProbeArgs),
    /// Drive the interceptor against an in-memory device and report its counters.
    Simulate(SimulateArgs),
    /// Print the configuration an intercepted process would load.
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Kernel launches issued by each thread.
    #[arg(short = 'n', long = "launches", default_value_t = 10_000)]
    launches: u64,

    /// Concurrent launching threads.
    #[arg(short = 't', long = "threads", default_value_t = 4)]
    threads: usize,

    /// Tracking mode override: per_call, sampled or dual_edge.
    #[arg(short = 'm', long = "mode")]
    mode: Option<String>,

    /// Completion ring capacity override.
    #[arg(long = "ring-capacity")]
    ring_capacity: Option<usize>,

    /// Simulated device memory in MiB.
    #[arg(long = "device-mib", default_value_t = 16_384)]
    device_mib: u64,

    /// Memory each thread allocates before launching, in MiB.
    #[arg(long = "alloc-mib", default_value_t = 256)]
    alloc_mib: u64,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Probe(args) if args.json => Some("probe"),
        Commands::Simulate(args) if args.json => Some("simulate"),
        Commands::Config(args) if args.json => Some("config"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Probe(args) => run_probe(args),
        Commands::Simulate(args) => run_simulate(args),
        Commands::Config(args) => run_config(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err.to_string()));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

// ─── probe ──────────────────────────────────────────────────────────────────

fn run_probe(args: ProbeArgs) -> Result<()> {
    let driver = CudaDriver::load()?;
    let probe = driver.probe();

    if args.json {
        if let Some(err) = &probe.init_error {
            return Err(InterceptError::DriverLoad(err.clone()));
        }
        println!("{}", probe_json(&probe));
        return Ok(());
    }
    println!("probe: {}", if probe.init_error.is_none() { "ok" } else { "error" });
    println!(
        "library={}",
        probe.library_path.as_deref().unwrap_or("unknown")
    );
    println!(
        "cuda_driver_version={}",
        probe.driver_version.as_deref().unwrap_or("unknown")
    );
    println!("device_count={}", probe.device_count.unwrap_or(0));
    for dev in &probe.devices {
        println!(
            "device={} uuid={} total_mem_mb={}",
            dev.ordinal, dev.uuid, dev.total_mem_mib
        );
    }
    println!("cuMemAllocAsync={}", probe.mem_alloc_async);
    println!("cuGetProcAddress={}", probe.get_proc_address);
    println!("cuGetProcAddress_v2={}", probe.get_proc_address_v2);
    if let Some(err) = &probe.init_error {
        println!("init_error={err}");
    }

    match probe.init_error {
        Some(err) => Err(InterceptError::DriverLoad(err)),
        None => Ok(()),
    }
}

fn probe_json(probe: &DriverProbe) -> Value {
    let mut doc = envelope("probe", true);
    merge(&mut doc, to_value(probe));
    doc
}

// ─── simulate ───────────────────────────────────────────────────────────────

fn run_simulate(args: SimulateArgs) -> Result<()> {
    let mut config = InterceptConfig::from_env()?;
    if let Some(mode) = &args.mode {
        config.tracking = parse_tracking_mode(mode)?;
    }
    if let Some(capacity) = args.ring_capacity {
        config.ring_capacity = capacity;
    }
    config.validate()?;
    if args.threads == 0 {
        return Err(InterceptError::Config("threads must be > 0".into()));
    }

    let driver = Arc::new(SimDriver::auto_completing(
        args.device_mib.saturating_mul(MIB),
    ));
    let arbiter = LogArbiter::new();
    let locator = {
        let arbiter = arbiter.clone();
        Arc::new(move |_device: &DeviceIdentity| -> Option<Arc<dyn Arbiter>> {
            Some(arbiter.clone() as Arc<dyn Arbiter>)
        }) as Arc<dyn ArbiterLocator>
    };
    let interceptor = Interceptor::new(config, driver.clone(), locator)?;
    interceptor.start()?;

    let started = Instant::now();
    let outcome = thread::scope(|scope| {
        let workers: Vec<_> = (0..args.threads)
            .map(|_| scope.spawn(|| simulate_worker(&interceptor, &args)))
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    Err(InterceptError::InvariantViolation(
                        "simulation worker panicked".into(),
                    ))
                })
            })
            .collect::<Result<Vec<bool>>>()
    });
    let report = interceptor.stop()?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let admitted = outcome?;
    let rejected_workers = admitted.iter().filter(|ok| !**ok).count();

    let stats = interceptor.stats();
    let (submit_start, submit_end) = arbiter.totals();
    let counters = driver.counters();

    if args.json {
        let mut doc = envelope("simulate", true);
        merge(
            &mut doc,
            json!({
                "threads": args.threads,
                "launches_per_thread": args.launches,
                "elapsed_ms": elapsed_ms,
                "rejected_workers": rejected_workers,
                "monitor": report.map(to_value).unwrap_or(Value::Null),
                "stats": to_value(stats),
                "arbiter": { "submit_start": submit_start, "submit_end": submit_end },
                "driver": to_value(counters),
            }),
        );
        println!("{doc}");
    } else {
        println!("simulate: ok");
        println!("tracking={}", stats.tracking.as_str());
        println!("threads={} launches_per_thread={}", args.threads, args.launches);
        println!("elapsed_ms={elapsed_ms}");
        println!(
            "submitted={} tracked={} ended={} untracked={} pending={}",
            stats.launches.submitted,
            stats.launches.tracked,
            stats.launches.ended,
            stats.launches.untracked,
            stats.launches.pending
        );
        println!(
            "max_inflight_us={} mean_inflight_us={}",
            stats.launches.max_inflight_us, stats.launches.mean_inflight_us
        );
        println!(
            "admitted={} rejected={} allocated_bytes={}",
            stats.admission.admitted, stats.admission.rejected, stats.admission.allocated_bytes
        );
        println!(
            "ring_capacity={} handles_created={} handles_destroyed={}",
            stats.ring_capacity, stats.handles_created, stats.handles_destroyed
        );
        println!("arbiter_submit_start={submit_start} arbiter_submit_end={submit_end}");
        match report {
            Some(report) => println!("monitor_retired={} monitor_drained={}", report.retired, report.drained),
            None => println!("monitor=detached"),
        }
    }
    Ok(())
}

/// One simulated client thread. Returns whether its allocation was admitted.
fn simulate_worker(interceptor: &Interceptor, args: &SimulateArgs) -> Result<bool> {
    let allocation = match interceptor.mem_alloc(args.alloc_mib.saturating_mul(MIB)) {
        Ok(ptr) => Some(ptr),
        Err(InterceptError::OutOfMemory { .. }) => None,
        Err(err) => return Err(err),
    };

    let launch = KernelLaunch::empty(StreamHandle::DEFAULT);
    for _ in 0..args.launches {
        // SAFETY: the simulated driver never dereferences launch arguments.
        unsafe { interceptor.launch_kernel(&launch) }?;
    }

    let admitted = allocation.is_some();
    if let Some(ptr) = allocation {
        interceptor.mem_free(ptr)?;
    }
    Ok(admitted)
}

// ─── config ─────────────────────────────────────────────────────────────────

fn run_config(args: ConfigArgs) -> Result<()> {
    let config = InterceptConfig::from_env()?;
    if args.json {
        let mut doc = envelope("config", true);
        merge(&mut doc, json!({ "config": to_value(&config) }));
        println!("{doc}");
    } else {
        println!("tracking={}", config.tracking.as_str());
        println!("sample_interval_ms={}", config.sample_interval_ms);
        println!("ring_capacity={}", config.ring_capacity);
        println!("blocking_reserve={}", config.blocking_reserve);
        match config.memory_limit_mib {
            Some(mib) => println!("memory_limit_mib={mib}"),
            None => println!("memory_limit_mib=none"),
        }
        println!("alloc_backing={}", config.alloc_backing.as_str());
        println!("stats_interval_ms={}", config.stats_interval_ms);
        println!("idle_poll_us={}", config.idle_poll_us);
        println!("shutdown_timeout_ms={}", config.shutdown_timeout_ms);
    }
    Ok(())
}

// ─── JSON helpers ───────────────────────────────────────────────────────────

fn envelope(command: &str, ok: bool) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": ok,
    })
}

fn merge(doc: &mut Value, extra: Value) {
    if let (Value::Object(doc), Value::Object(extra)) = (doc, extra) {
        doc.extend(extra);
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn command_error_json(command: &str, error: &str) -> String {
    let mut doc = envelope(command, false);
    merge(&mut doc, json!({ "error": error }));
    doc.to_string()
}
