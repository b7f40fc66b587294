use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand};
use scsi_rescan_core::{
    build_provider, AllOf, DeviceExists, DeviceGone, DeviceSelector, DevicesReady, Hctl,
    LunMapping, MappingExists, MappingGone, Predicate, ProcessSpec, RescanCoordinator,
    RescanError, RescanIsolation, Sg3UtilsExecutor, TopologyConfig, TopologyService, WaitTimeout,
};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_TIMEOUT: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "scsi-rescan",
    version,
    about = "Rescan the SCSI bus and wait until the device topology matches expectations."
)]
struct Cli {
    /// Topology configuration file (JSON).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rescan, then poll until every condition holds or the timeout expires.
    Wait(WaitArgs),
    /// Print the current topology snapshot as JSON.
    Topology(TopologyArgs),
    /// Run one platform rescan to completion (used by subprocess isolation).
    #[command(hide = true)]
    RescanWorker(WorkerArgs),
}

#[derive(Debug, Args)]
struct WaitArgs {
    /// Seconds to wait for convergence; 0 waits forever.
    #[arg(long, default_value_t = 120, value_name = "SECONDS")]
    timeout: u64,

    /// Wait for a device to appear: an HCTL, `serial:<sn>`, or a device name.
    #[arg(
        long = "device-exists",
        value_name = "DEVICE",
        value_parser = parse_selector,
        action = ArgAction::Append
    )]
    device_exists: Vec<DeviceSelector>,

    /// Wait for a device to disappear.
    #[arg(
        long = "device-gone",
        value_name = "DEVICE",
        value_parser = parse_selector,
        action = ArgAction::Append
    )]
    device_gone: Vec<DeviceSelector>,

    /// Wait for a LUN mapping (`host:channel:target:lun`, host may be `*`).
    #[arg(
        long = "mapping-exists",
        value_name = "MAPPING",
        value_parser = parse_mapping,
        action = ArgAction::Append
    )]
    mapping_exists: Vec<LunMapping>,

    /// Wait for a LUN mapping to go away.
    #[arg(
        long = "mapping-gone",
        value_name = "MAPPING",
        value_parser = parse_mapping,
        action = ArgAction::Append
    )]
    mapping_gone: Vec<LunMapping>,

    /// Wait for a device to answer TEST UNIT READY.
    #[arg(
        long = "ready",
        value_name = "DEVICE",
        value_parser = parse_selector,
        action = ArgAction::Append
    )]
    ready: Vec<DeviceSelector>,

    /// Wait for every SCSI block device to answer TEST UNIT READY.
    #[arg(long)]
    all_ready: bool,

    /// Poll interval override in milliseconds.
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Trigger the initial rescan without waiting for it to finish.
    #[arg(long)]
    no_wait_initial: bool,

    /// Run rescans in a separate `rescan-worker` process.
    #[arg(long)]
    isolate: bool,

    /// Print the outcome as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TopologyArgs {
    /// Optional output file instead of stdout.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Rescan before reading the topology.
    #[arg(long)]
    rescan: bool,
}

#[derive(Debug, Args)]
struct WorkerArgs {
    /// Run the cheaper retry rescan instead of the full one.
    #[arg(long)]
    retry: bool,
}

#[derive(Debug, Serialize)]
struct TopologyView<'a> {
    provider: &'a str,
    #[serde(flatten)]
    snapshot: &'a scsi_rescan_core::TopologySnapshot,
    non_multipath_block_devices: Vec<Hctl>,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Wait(args) => run_wait_command(args, config, cli.config),
        Commands::Topology(args) => run_topology_command(args, &config),
        Commands::RescanWorker(args) => run_worker_command(args, &config),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TopologyConfig> {
    match path {
        Some(path) => TopologyConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(TopologyConfig::default()),
    }
}

fn topology_service(config: &TopologyConfig) -> Result<Arc<TopologyService>> {
    let provider = build_provider(config, Arc::new(Sg3UtilsExecutor::new()))
        .context("failed to set up topology provider")?;
    Ok(Arc::new(TopologyService::new(provider)))
}

fn run_wait_command(
    args: WaitArgs,
    mut config: TopologyConfig,
    config_path: Option<PathBuf>,
) -> Result<ExitCode> {
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.rescan.poll_interval_ms = poll_interval_ms;
    }
    if args.no_wait_initial {
        config.rescan.wait_for_initial_rescan = false;
    }
    if args.isolate {
        config.rescan.isolation = RescanIsolation::Subprocess(worker_spec(config_path)?);
    }
    config.validate().context("invalid rescan options")?;

    let predicate = build_predicate(&args);
    let timeout = WaitTimeout::from_legacy_seconds(args.timeout);
    let executor = Arc::new(Sg3UtilsExecutor::new());
    let mut coordinator = RescanCoordinator::new(topology_service(&config)?, executor);

    match coordinator.rescan_and_wait_for(predicate.as_deref(), timeout, &config.rescan) {
        Ok(outcome) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome).context("failed to serialize outcome")?
                );
            } else {
                println!(
                    "Converged after {} iteration(s) in {:.1}s.",
                    outcome.iterations,
                    outcome.elapsed().as_secs_f64()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(RescanError::Timeout { predicate, outcome }) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome).context("failed to serialize outcome")?
                );
            }
            eprintln!(
                "timed out waiting for {} after {:.1}s (last result {:?})",
                predicate,
                outcome.elapsed().as_secs_f64(),
                outcome.last_predicate_result
            );
            Ok(ExitCode::from(EXIT_TIMEOUT))
        }
        Err(err) => Err(err).context("rescan aborted"),
    }
}

fn worker_spec(config_path: Option<PathBuf>) -> Result<ProcessSpec> {
    let exe = env::current_exe().context("failed to locate the scsi-rescan executable")?;
    let mut spec = ProcessSpec::new(exe.to_string_lossy(), Vec::<String>::new());
    if let Some(path) = config_path {
        spec = spec
            .with_arg("--config")
            .with_arg(path.to_string_lossy());
    }
    Ok(spec.with_arg("rescan-worker"))
}

fn build_predicate(args: &WaitArgs) -> Option<Box<dyn Predicate>> {
    let mut predicates: Vec<Box<dyn Predicate>> = Vec::new();
    for selector in &args.device_exists {
        predicates.push(Box::new(DeviceExists(selector.clone())));
    }
    for selector in &args.device_gone {
        predicates.push(Box::new(DeviceGone(selector.clone())));
    }
    for mapping in &args.mapping_exists {
        predicates.push(Box::new(MappingExists(*mapping)));
    }
    for mapping in &args.mapping_gone {
        predicates.push(Box::new(MappingGone(*mapping)));
    }
    if args.all_ready {
        predicates.push(Box::new(DevicesReady::default()));
    } else if !args.ready.is_empty() {
        predicates.push(Box::new(DevicesReady(args.ready.clone())));
    }

    match predicates.len() {
        0 => None,
        1 => predicates.pop(),
        _ => Some(Box::new(AllOf(predicates))),
    }
}

fn run_topology_command(args: TopologyArgs, config: &TopologyConfig) -> Result<ExitCode> {
    let service = topology_service(config)?;
    if args.rescan {
        service
            .provider()
            .initiate_rescan(true)
            .context("rescan failed")?;
    }
    let snapshot = service.refresh().context("failed to read topology")?;
    let view = TopologyView {
        provider: service.provider().name(),
        snapshot: &snapshot,
        non_multipath_block_devices: snapshot
            .non_multipath_block_devices()
            .iter()
            .map(|device| device.hctl)
            .collect(),
    };
    let payload = serde_json::to_string_pretty(&view).context("failed to serialize topology")?;

    match args.output {
        Some(output) => {
            fs::write(&output, payload)
                .with_context(|| format!("failed to write topology to {}", output.display()))?;
            println!("Topology written to {}", output.display());
        }
        None => println!("{payload}"),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_worker_command(args: WorkerArgs, config: &TopologyConfig) -> Result<ExitCode> {
    let service = topology_service(config)?;
    let provider = service.provider();
    info!(
        "{} rescan worker starting ({})",
        provider.name(),
        if args.retry { "retry" } else { "full" }
    );
    if args.retry {
        provider.retry_rescan_and_wait()
    } else {
        provider.initiate_rescan(true)
    }
    .context("rescan worker failed")?;
    Ok(ExitCode::SUCCESS)
}

/// `serial:<sn>`, `name:<device>`, `hctl:<h:c:t:l>`, or a bare HCTL or name.
fn parse_selector(value: &str) -> Result<DeviceSelector, String> {
    if let Some(serial) = value.strip_prefix("serial:") {
        return Ok(DeviceSelector::BySerial(serial.to_string()));
    }
    if let Some(name) = value.strip_prefix("name:") {
        return Ok(DeviceSelector::ByName(name.to_string()));
    }
    if let Some(hctl) = value.strip_prefix("hctl:") {
        return hctl
            .parse::<Hctl>()
            .map(DeviceSelector::ByHctl)
            .map_err(|err| err.to_string());
    }
    if value.is_empty() {
        return Err("device selector must not be empty".to_string());
    }
    Ok(match value.parse::<Hctl>() {
        Ok(hctl) => DeviceSelector::ByHctl(hctl),
        Err(_) => DeviceSelector::ByName(value.to_string()),
    })
}

fn parse_mapping(value: &str) -> Result<LunMapping, String> {
    let parts = value.split(':').collect::<Vec<_>>();
    let [host, channel, target, lun] = parts.as_slice() else {
        return Err(format!("expected host:channel:target:lun, got {value:?}"));
    };
    let number = |field: &str, text: &str| {
        text.parse::<u64>()
            .map_err(|_| format!("invalid {field} {text:?} in {value:?}"))
    };
    let small = |field: &str, text: &str| {
        text.parse::<u32>()
            .map_err(|_| format!("invalid {field} {text:?} in {value:?}"))
    };
    Ok(LunMapping {
        host: if *host == "*" {
            None
        } else {
            Some(small("host", host)?)
        },
        channel: small("channel", channel)?,
        target: small("target", target)?,
        lun: number("lun", lun)?,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
