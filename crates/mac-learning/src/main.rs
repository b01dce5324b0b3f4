//! maclearnd - vRouter MAC learning daemon
//!
//! Runs the learning service against the in-memory datapath simulation.
//! With `--simulate`, a small topology is created and synthetic traps are
//! injected so the pipeline can be watched end to end.

use anyhow::Context;
use clap::Parser;
use mac_learning::sim::SimEnvironment;
use mac_learning::{LearningConfig, MacLearningService, PacketTrap};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vrouter_types::{InterfaceId, MacAddress, VrfId};

/// vRouter MAC learning daemon
#[derive(Parser, Debug)]
#[command(name = "maclearnd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of learning partitions (overrides the configuration file)
    #[arg(short = 'p', long)]
    partitions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Statistics report interval in seconds (0 disables)
    #[arg(long, default_value = "10")]
    stats_interval: u64,

    /// Create a demo topology and inject synthetic traps
    #[arg(long)]
    simulate: bool,

    /// Number of synthetic MACs to learn with --simulate
    #[arg(long, default_value = "1000")]
    sim_macs: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("maclearnd: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<LearningConfig> {
    let mut config = match &args.config {
        Some(path) => LearningConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LearningConfig::default(),
    };
    if let Some(partitions) = args.partitions {
        config = config.with_partitions(partitions);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_demo_topology(env: &SimEnvironment) {
    env.add_vrf(1, "default-domain:demo:vn1:vn1");
    env.set_vrf_aging(1, 30);
    env.add_vn(1, "default-domain:demo:vn1");
    for port in 1..=4 {
        env.add_vm_interface(port, &format!("tap{port}"), 1, 1);
    }
}

fn inject_traps(service: &MacLearningService, count: u32) -> anyhow::Result<()> {
    for n in 0..count {
        let b = n.to_be_bytes();
        let mac = MacAddress::new([0x02, 0x00, b[0], b[1], b[2], b[3]]);
        let port = InterfaceId(1 + n % 4);
        service
            .proto()
            .enqueue(PacketTrap::new(port, VrfId(1), mac))
            .context("enqueueing trap")?;
    }
    info!(count, "maclearnd: Injected synthetic traps");
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    info!("--- Starting maclearnd ---");
    info!(
        partitions = config.partition_count,
        simulate = args.simulate,
        "maclearnd: Configuration loaded"
    );

    let env = SimEnvironment::new();
    if args.simulate {
        build_demo_topology(&env);
    }

    let service =
        MacLearningService::spawn(config, env.ctx()).context("starting learning service")?;
    if args.simulate {
        inject_traps(&service, args.sim_macs)?;
    }

    let mut stats_tick = (args.stats_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.stats_interval)));

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "maclearnd: Failed to wait for Ctrl-C");
                }
                info!("maclearnd: Received shutdown signal");
                break;
            }
            _ = async {
                match stats_tick.as_mut() {
                    Some(tick) => { tick.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                match service.proto().stats().await {
                    Ok(stats) => match serde_json::to_string(&stats) {
                        Ok(json) => info!(
                            entries = stats.total_entries(),
                            stats = %json,
                            "maclearnd: Statistics"
                        ),
                        Err(e) => warn!(error = %e, "maclearnd: Failed to encode statistics"),
                    },
                    Err(e) => warn!(error = %e, "maclearnd: Failed to collect statistics"),
                }
            }
        }
    }

    service.shutdown().await;
    info!("maclearnd: Graceful shutdown complete");
    Ok(())
}
