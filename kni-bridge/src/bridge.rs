//! Per-port packet bridge
//!
//! A `PortBridge` lives inside one data-plane worker and is driven from the
//! worker's poll loop:
//! - `forward_unhandled`: fast path -> kernel, one buffer at a time
//! - `poll`: control request servicing + kernel -> fast path, once per iteration
//!
//! Nothing here blocks. When the kernel side refuses a buffer it is dropped
//! (returned to its pool) and counted; there is no retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::kernel::{AckRequests, KernelIface, RequestOps};
use crate::pool::PoolBuffer;
use crate::port::Port;

/// Bridge counters, shared with whoever aggregates statistics
#[derive(Debug, Default)]
pub struct BridgeStats {
    inbound: AtomicU64,
    outbound: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Buffers handed to the kernel
    pub inbound: u64,
    /// Kernel packets handed to the fast path for transmission
    pub outbound: u64,
    /// Buffers the kernel side refused
    pub dropped: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inbound: self.inbound.load(Ordering::Relaxed),
            outbound: self.outbound.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::ops::AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.inbound += other.inbound;
        self.outbound += other.outbound;
        self.dropped += other.dropped;
    }
}

/// Bridge state of one worker for one port
pub struct PortBridge<'a, I> {
    port: &'a Port<I>,
    ops: &'a dyn RequestOps,
    stats: Arc<BridgeStats>,
    burst_size: usize,
    /// Reused drain buffer, never grows past `burst_size`
    batch: Vec<PoolBuffer>,
}

impl<'a, I: KernelIface> PortBridge<'a, I> {
    /// Bridge for `port`, draining at most `burst_size` kernel packets per poll
    ///
    /// Control requests are acknowledged with [`AckRequests`] unless
    /// [`with_ops`](Self::with_ops) installs other callbacks.
    pub fn new(port: &'a Port<I>, burst_size: usize, stats: Arc<BridgeStats>) -> Self {
        Self {
            port,
            ops: &AckRequests,
            stats,
            burst_size,
            batch: Vec::with_capacity(burst_size),
        }
    }

    pub fn with_ops(mut self, ops: &'a dyn RequestOps) -> Self {
        self.ops = ops;
        self
    }

    pub fn port(&self) -> &'a Port<I> {
        self.port
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Hand a buffer the fast path did not handle to the kernel
    ///
    /// Ownership of `buf` is gone after this call: it is either queued to the
    /// kernel (returns `true`) or released back to its pool (`false`).
    pub fn forward_unhandled(&self, buf: PoolBuffer) -> bool {
        let Some(handle) = self.port.bridge() else {
            return false;
        };

        match handle.iface().send(buf) {
            Ok(()) => {
                self.stats.inbound.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(buf) => {
                trace!(name = %handle.name(), len = buf.len(), "Kernel refused buffer");
                drop(buf);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Service control requests and forward kernel packets to `tx`
    ///
    /// Call once per poll iteration, whether or not there is traffic: the
    /// request servicing is what lets the kernel interface finish link-up.
    /// At most `burst_size` packets are forwarded; the rest stay queued for
    /// the next call. Returns the number forwarded.
    pub fn poll<F>(&mut self, mut tx: F) -> usize
    where
        F: FnMut(PoolBuffer),
    {
        let port = self.port;
        let Some(handle) = port.bridge() else {
            return 0;
        };
        let iface = handle.iface();

        iface.handle_requests(self.ops);

        self.batch.clear();
        iface.rx_burst(&mut self.batch, self.burst_size);

        let mut forwarded = 0;
        for buf in self.batch.drain(..) {
            tx(buf);
            forwarded += 1;
        }
        self.stats
            .outbound
            .fetch_add(forwarded as u64, Ordering::Relaxed);
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, DEFAULT_BUFFER_SIZE};
    use crate::test_util::MockIface;

    #[test]
    fn test_stats_snapshot_sum() {
        let mut total = StatsSnapshot::default();
        total += StatsSnapshot {
            inbound: 1,
            outbound: 2,
            dropped: 3,
        };
        total += StatsSnapshot {
            inbound: 10,
            outbound: 20,
            dropped: 30,
        };
        assert_eq!(
            total,
            StatsSnapshot {
                inbound: 11,
                outbound: 22,
                dropped: 33
            }
        );
    }

    #[test]
    fn test_unbridged_port_frees_buffer() {
        let pool = Arc::new(BufferPool::new(4, DEFAULT_BUFFER_SIZE).unwrap());
        let port: Port<MockIface> = Port::new(0, vec![pool.clone()]);
        let stats = Arc::new(BridgeStats::new());
        let mut bridge = PortBridge::new(&port, 8, stats.clone());

        let buf = pool.alloc_from(b"arp").unwrap();
        assert_eq!(pool.available(), 3);
        assert!(!bridge.forward_unhandled(buf));
        assert_eq!(pool.available(), 4);

        assert_eq!(bridge.poll(|_| panic!("nothing to forward")), 0);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
