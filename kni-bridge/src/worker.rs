//! Per-port bridge worker threads
//!
//! Each bridged port gets one thread running a non-blocking poll loop over
//! its [`PortBridge`]. The fast path's own transmit path is passed in as a
//! `FastPathTx`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::bridge::{BridgeStats, PortBridge, StatsSnapshot};
use crate::kernel::KernelIface;
use crate::pool::PoolBuffer;
use crate::port::PortRegistry;

/// Transmit side of the fast path for one port
pub trait FastPathTx: Send + 'static {
    fn tx_send(&mut self, buf: PoolBuffer);
}

impl<F> FastPathTx for F
where
    F: FnMut(PoolBuffer) + Send + 'static,
{
    fn tx_send(&mut self, buf: PoolBuffer) {
        self(buf)
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<BridgeStats>,
    /// Registry index of the port
    pub index: usize,
}

impl WorkerHandle {
    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| "Worker thread panicked".to_string())
        } else {
            Ok(())
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the bridge worker for the port at registry position `index`
pub fn spawn_worker<I, T>(
    ports: Arc<PortRegistry<I>>,
    index: usize,
    burst_size: usize,
    tx: T,
) -> Result<WorkerHandle, String>
where
    I: KernelIface + 'static,
    T: FastPathTx,
{
    if ports.get(index).is_none() {
        return Err(format!("No port at index {index}"));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(BridgeStats::new());
    let shutdown_clone = shutdown.clone();
    let stats_clone = stats.clone();

    let thread = thread::Builder::new()
        .name(format!("kni-worker-{index}"))
        .spawn(move || run_worker(&ports, index, burst_size, tx, stats_clone, &shutdown_clone))
        .map_err(|e| format!("Failed to spawn worker thread: {e}"))?;

    Ok(WorkerHandle {
        thread: Some(thread),
        shutdown,
        stats,
        index,
    })
}

/// Stop every worker, wait for all of them and sum their counters
pub fn stop_workers(workers: Vec<WorkerHandle>) -> StatsSnapshot {
    for worker in &workers {
        worker.stop();
    }

    let mut total = StatsSnapshot::default();
    for worker in workers {
        let index = worker.index;
        let stats = Arc::clone(worker.stats());
        if let Err(e) = worker.join() {
            error!(index, error = %e, "Bridge worker failed");
        }
        total += stats.snapshot();
    }
    total
}

/// Main worker loop
fn run_worker<I: KernelIface, T: FastPathTx>(
    ports: &PortRegistry<I>,
    index: usize,
    burst_size: usize,
    mut tx: T,
    stats: Arc<BridgeStats>,
    shutdown: &AtomicBool,
) {
    let Some(port) = ports.get(index) else {
        error!(index, "Worker started for missing port");
        return;
    };

    info!(index, port_id = port.id(), "Starting bridge worker");

    let mut bridge = PortBridge::new(port, burst_size, stats);
    while !shutdown.load(Ordering::Relaxed) {
        if bridge.poll(|buf| tx.tx_send(buf)) == 0 {
            std::hint::spin_loop();
        }
    }

    debug!(index, stats = ?bridge.stats().snapshot(), "Bridge worker shutting down");
}
