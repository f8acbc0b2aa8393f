//! FTSync node
//!
//! Powers on one fault tolerant node (master or standby) against a simulated
//! VM. The master runs a small guest workload that keeps dirtying pages so the
//! periodic memory rounds have something to replicate.

use clap::Parser;
use ftsync_core::sim::SimulatedVm;
use ftsync_core::{FaultTolerance, FtmConfig, Role, VmBackend, VmLifecycle, VmState};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// FTSync node CLI arguments
#[derive(Parser, Debug)]
#[command(name = "ftsync-node")]
#[command(about = "Fault tolerant VM sync node (simulated VM)", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c', env = "FTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Node role: master or standby
    #[arg(long)]
    role: Option<Role>,

    /// Standby address (the master connects to it, a standby listens on it)
    #[arg(long)]
    address: Option<String>,

    /// Standby TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Shared handshake password
    #[arg(long)]
    password: Option<String>,

    /// Interval between memory sync rounds in milliseconds (0 means default)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Request a checkpoint this often in milliseconds (master only)
    #[arg(long)]
    checkpoint_ms: Option<u64>,

    /// Guest RAM size in 4 KiB pages
    #[arg(long, default_value_t = 1024)]
    pages: usize,

    /// Simulated guest writes per second (master only, 0 disables)
    #[arg(long, default_value_t = 50)]
    writes_per_sec: u32,

    /// Log replication counters this often in seconds
    #[arg(long, default_value_t = 10)]
    stats_secs: u64,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let worker_threads = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 8);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("ftsync-worker")
        .enable_all()
        .build()?;

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ftsync_core=debug,ftsync_node=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ftsync_core=info,ftsync_node=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    rt.block_on(async_main(args))
}

/// Build the node configuration: defaults, then file, then env, then CLI
fn load_config(args: &Args) -> anyhow::Result<FtmConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            FtmConfig::from_file(path)?
        }
        None => FtmConfig::default(),
    };
    config.apply_env();

    if let Some(role) = args.role {
        config.role = role;
    }
    if let Some(address) = &args.address {
        config.address = address.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    if let Some(ms) = args.interval_ms {
        config.sync_interval = Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let role = config.role;

    tracing::info!(
        "Starting FTSync {} for {}:{} ({} pages of guest RAM)",
        role,
        config.address,
        config.port,
        args.pages
    );

    let vm = SimulatedVm::new(args.pages);
    let ft = FaultTolerance::power_on(config, VmBackend::from_vm(vm.clone())).await?;

    if let Some(addr) = ft.local_addr() {
        tracing::info!("Standby listening on {}", addr);
    }

    let workload = match role {
        Role::Master if args.writes_per_sec > 0 => {
            Some(tokio::spawn(guest_workload(vm.clone(), args.writes_per_sec)))
        }
        _ => None,
    };

    let mut checkpoints = match (role, args.checkpoint_ms) {
        (Role::Master, Some(ms)) if ms > 0 => Some(ticker(Duration::from_millis(ms))),
        _ => None,
    };
    let mut stats_ticker = ticker(Duration::from_secs(args.stats_secs.max(1)));

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = next_tick(&mut checkpoints) => {
                if let Err(e) = ft.sync_state().await {
                    tracing::warn!("Checkpoint failed: {}", e);
                }
            }
            _ = stats_ticker.tick() => {
                tracing::info!("{:?}", ft.stats());
                if ft.is_finished() {
                    tracing::info!("Worker stopped");
                    break;
                }
            }
        }
    }

    if let Some(workload) = workload {
        workload.abort();
    }

    let stats = ft.stats();
    match ft.terminate().await? {
        Some(exit) => tracing::info!("Standby stopped: {}", exit),
        None => tracing::info!("Master stopped"),
    }
    tracing::info!("Final counters: {:?}", stats);
    Ok(())
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Dirty random guest pages while the VM runs
async fn guest_workload(vm: Arc<SimulatedVm>, writes_per_sec: u32) {
    const WRITE_LEN: usize = 64;

    let mut ticker = ticker(Duration::from_secs(1) / writes_per_sec);
    let span = vm.ram_size().saturating_sub(WRITE_LEN) as u64;

    loop {
        ticker.tick().await;
        if vm.state() != VmState::Running {
            continue;
        }

        let (addr, value) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..=span), rng.gen_range(0..=u8::MAX))
        };
        if let Err(e) = vm.guest_write(addr, &[value; WRITE_LEN]) {
            tracing::debug!("Guest write at {:#x} failed: {}", addr, e);
        }
    }
}
