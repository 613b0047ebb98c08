use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use kni_bridge::kernel::TapKernel;
use kni_bridge::link::{self, IoctlLinkControl};
use kni_bridge::pool::{BufferPool, DEFAULT_BUFFER_SIZE, PoolBuffer};
use kni_bridge::port::NetdevPortInfo;
use kni_bridge::worker::{WorkerHandle, spawn_worker, stop_workers};
use kni_bridge::{Bridge, BridgeConfig, KernelBridge, KernelIface, Port, PortInfo, PortRegistry};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration path.
const CONFIG_PATH: &str = "/etc/kni-bridge/config.json";

#[derive(Debug, Parser)]
#[command(name = "kni-bridge", about = "Kernel interfaces for fast-path ports")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the interface name prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Run without creating kernel interfaces
    #[arg(long)]
    disable: bool,

    /// Buffers per worker pool
    #[arg(long, default_value_t = 4096)]
    pool_size: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %format!("{e:#}"), "kni-bridge failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = BridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(prefix) = args.prefix {
        config.ifname_prefix = prefix;
    }
    if args.disable {
        config.enabled = false;
    }
    config.validate()?;

    let mut info = NetdevPortInfo::new();
    let mut ports = Vec::with_capacity(config.ports.len());
    for port in &config.ports {
        let pools = (0..port.workers)
            .map(|_| BufferPool::new(args.pool_size, DEFAULT_BUFFER_SIZE).map(Arc::new))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("Failed to create buffer pools for port {}", port.id))?;
        info.insert(port.id, port.netdev.clone());
        ports.push(Port::new(port.id, pools));
    }
    let mut registry = PortRegistry::new(ports);

    let burst_size = config.burst_size;
    let mut bridge = Bridge::new(config, TapKernel::new(), info);

    // Port queries run their own netlink runtime
    let (mut bridge, mut registry, started) = tokio::task::spawn_blocking(move || {
        let started = bridge.start(&mut registry);
        (bridge, registry, started)
    })
    .await
    .context("Bridge start task failed")?;
    if let Err(e) = started {
        // Release what was created before the failure
        bridge.stop(&mut registry);
        return Err(e).context("Failed to start kernel bridge");
    }

    let registry = Arc::new(registry);
    let workers = match spawn_workers(&registry, burst_size) {
        Ok(workers) => workers,
        Err(e) => {
            teardown(&mut bridge, registry, Vec::new())?;
            return Err(e);
        }
    };

    // The workers are polling, so link-up requests get answered
    let link_registry = Arc::clone(&registry);
    match tokio::task::spawn_blocking(move || link::link_up(&link_registry, &IoctlLinkControl))
        .await
        .context("Link-up task failed")?
    {
        Ok(count) => info!(count, "Kernel interfaces up"),
        Err(e) => warn!(error = %e, "Link-up incomplete, continuing without full kernel connectivity"),
    }

    wait_for_shutdown().await?;

    teardown(&mut bridge, registry, workers)
}

/// Spawn one bridge worker per bridged port
///
/// No fast path is attached to this daemon: nothing calls
/// `forward_unhandled`, and frames the kernel transmits are traced and
/// dropped. It exercises interface lifecycle and link state only.
///
/// On failure the workers spawned so far are stopped and joined.
fn spawn_workers<I: KernelIface + 'static>(
    registry: &Arc<PortRegistry<I>>,
    burst_size: usize,
) -> anyhow::Result<Vec<WorkerHandle>> {
    let mut workers = Vec::new();
    for (index, port) in registry.iter().enumerate() {
        if !port.has_bridge() {
            continue;
        }
        let port_id = port.id();
        let tx = move |buf: PoolBuffer| {
            trace!(port_id, len = buf.len(), "Kernel frame to fast path");
        };
        match spawn_worker(Arc::clone(registry), index, burst_size, tx) {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                stop_workers(workers);
                return Err(anyhow!(e));
            }
        }
    }
    Ok(workers)
}

/// Stop the workers, then release every kernel interface
fn teardown<K, P>(
    bridge: &mut Bridge<K, P>,
    registry: Arc<PortRegistry<K::Iface>>,
    workers: Vec<WorkerHandle>,
) -> anyhow::Result<()>
where
    K: KernelBridge,
    P: PortInfo,
{
    let total = stop_workers(workers);

    let mut registry = Arc::try_unwrap(registry)
        .map_err(|_| anyhow!("Port registry still in use after workers stopped"))?;
    let failures = bridge.stop(&mut registry);

    info!(
        inbound = total.inbound,
        outbound = total.outbound,
        dropped = total.dropped,
        release_failures = failures.len(),
        "Stopped"
    );
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}
