//! flowcached entry point.
//!
//! Loads the deployment config, sets up every switch, then runs the
//! listeners and dispatcher until Ctrl-C or a fatal channel error. Without a
//! P4Runtime transport the daemon drives the in-memory simulated fabric.

use anyhow::{Context, Result};
use clap::Parser;
use flowcached::channel::sim::SimulatedFabric;
use flowcached::channel::{ForwardingPipeline, RawPacketIn};
use flowcached::codec::encode_packet_in;
use flowcached::config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use flowcached::packet::{build_ipv4_frame, Ipv4Flow};
use flowcached::schema::{PipelineSchema, PUNT_REASON_FIELD};
use flowcached::Controller;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const IPPROTO_UDP: u8 = 17;
const HOST_PORT: u32 = 1;

/// Reactive flow-cache controller
#[derive(Parser, Debug)]
#[command(name = "flowcached")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Read counters and dump tables after every install
    #[arg(long)]
    diagnostics: bool,

    /// Override the fixed retry interval for transient channel errors
    #[arg(long)]
    retry_interval_ms: Option<u64>,

    /// Do not expire idle rules on the simulated switches
    #[arg(long)]
    no_idle_expiry: bool,

    /// Punt one UDP packet per host pair into the simulated fabric at startup
    #[arg(long)]
    demo_traffic: bool,

    /// Write Prometheus metrics in text format to this file on exit
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{}'", level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
    Ok(())
}

fn load_pipeline(config: &ControllerConfig) -> Result<ForwardingPipeline> {
    match (&config.pipeline.p4info, &config.pipeline.device_config) {
        (Some(p4info), Some(device_config)) => ForwardingPipeline::load(p4info, device_config)
            .with_context(|| {
                format!(
                    "failed to load pipeline artifacts {} / {}",
                    p4info.display(),
                    device_config.display()
                )
            }),
        _ => {
            warn!("flowcached: no pipeline artifacts configured, installing an empty pipeline");
            Ok(ForwardingPipeline::default())
        }
    }
}

/// Punts one packet per (local host, remote host) pair on each switch.
fn inject_demo_traffic(config: &ControllerConfig, fabric: &SimulatedFabric) -> Result<usize> {
    let schema = PipelineSchema::from_config(&config.pipeline)?;
    let field_id = |name: &str| {
        config
            .pipeline
            .packet_in
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.id)
    };
    let punt_reason_id = field_id(PUNT_REASON_FIELD).context("no punt_reason metadata field")?;

    let mut injected = 0;
    for switch in &config.switches {
        let Some(sim) = fabric.switch(&switch.name) else {
            continue;
        };
        let Some(routes) = config.routes.get(&switch.name) else {
            continue;
        };
        let local_hosts = routes
            .iter()
            .filter(|(_, port)| port.0 == HOST_PORT)
            .map(|(addr, _)| *addr);

        for src in local_hosts {
            for (&dst, &dst_mac) in config.addresses.iter().filter(|(dst, _)| **dst != src) {
                let src_mac = config.address(src)?;
                let flow = Ipv4Flow {
                    protocol: IPPROTO_UDP,
                    src,
                    dst,
                };
                let mut values = vec![(punt_reason_id, schema.flow_unknown())];
                if let Some(input_port_id) = field_id("input_port") {
                    values.push((input_port_id, u64::from(HOST_PORT)));
                }
                sim.inject_packet_in(RawPacketIn {
                    payload: build_ipv4_frame(src_mac, dst_mac, &flow, b"flowcached demo").into(),
                    metadata: encode_packet_in(schema.packet_in(), &values)?,
                });
                injected += 1;
            }
        }
    }
    Ok(injected)
}

async fn run(args: Args) -> Result<()> {
    let mut config = ControllerConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if args.diagnostics {
        config.diagnostics.enabled = true;
    }
    if let Some(interval) = args.retry_interval_ms {
        config.recovery.retry_interval_ms = interval;
    }

    info!(
        config = %args.config.display(),
        switches = config.switches.len(),
        retry_interval = ?config.retry_interval(),
        idle_timeout = ?config.idle_timeout(),
        "flowcached: starting"
    );

    let pipeline = load_pipeline(&config)?;
    let fabric = Arc::new(SimulatedFabric::new().with_idle_expiry(!args.no_idle_expiry));
    let controller = Controller::new(config.clone(), fabric.clone())?;

    let shutdown = controller.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("flowcached: received shutdown signal"),
            Err(e) => error!(error = %e, "flowcached: failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    let running = controller.start(pipeline).await?;
    if args.demo_traffic {
        let injected = inject_demo_traffic(&config, &fabric)?;
        info!(injected, "flowcached: demo traffic punted");
    }

    let metrics = running.metrics().clone();
    let result = running.run_until_shutdown().await;
    if let Some(path) = &args.metrics_file {
        let text = metrics.encode_text().context("failed to encode metrics")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "flowcached: metrics written");
    }
    let stats = result?;
    info!(?stats, "flowcached: stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("flowcached: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("flowcached: exiting with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
