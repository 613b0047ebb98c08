//! Kernel-side virtual interfaces
//!
//! This module defines the seam between the bridge and the host networking
//! stack:
//! - `KernelBridge`: the registration subsystem (create/release interfaces)
//! - `KernelIface`: one registered interface (packet queues, control requests)
//!
//! `TapKernel` implements both on top of Linux TAP devices. The in-memory
//! implementation used by tests lives in `test_util`.

pub mod tap;

use std::io;
use std::sync::Arc;

use crate::pool::{BufferPool, PoolBuffer};

pub use tap::{TapIface, TapKernel};

/// Descriptor handed to the OS when registering a virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceConf {
    /// Interface name, `<prefix><registry index>`
    pub name: String,
    /// Group id, equal to the physical port id
    pub group_id: u16,
    pub min_mtu: u16,
    pub max_mtu: u16,
    pub mtu: u16,
    pub mac: [u8; 6],
    /// Data room of the bound pool's buffers
    pub mbuf_size: usize,
}

/// A control request queued by the kernel side of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelRequest {
    ChangeMtu(u16),
    ConfigNetworkIf { up: bool },
    ConfigMacAddress([u8; 6]),
    ConfigPromiscuity(bool),
    ConfigAllmulticast(bool),
}

impl KernelRequest {
    /// Answer the request through `ops` for the port identified by `group_id`
    pub fn dispatch(&self, ops: &dyn RequestOps, group_id: u16) -> io::Result<()> {
        match *self {
            KernelRequest::ChangeMtu(mtu) => ops.change_mtu(group_id, mtu),
            KernelRequest::ConfigNetworkIf { up } => ops.config_network_if(group_id, up),
            KernelRequest::ConfigMacAddress(mac) => ops.config_mac_address(group_id, mac),
            KernelRequest::ConfigPromiscuity(on) => ops.config_promiscuity(group_id, on),
            KernelRequest::ConfigAllmulticast(on) => ops.config_allmulticast(group_id, on),
        }
    }
}

/// Callbacks answering kernel control requests
///
/// Every method acknowledges by default. Returning an error reports the
/// errno back to the kernel side.
pub trait RequestOps: Sync {
    fn change_mtu(&self, _port_id: u16, _mtu: u16) -> io::Result<()> {
        Ok(())
    }

    fn config_network_if(&self, _port_id: u16, _up: bool) -> io::Result<()> {
        Ok(())
    }

    fn config_mac_address(&self, _port_id: u16, _mac: [u8; 6]) -> io::Result<()> {
        Ok(())
    }

    fn config_promiscuity(&self, _port_id: u16, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn config_allmulticast(&self, _port_id: u16, _on: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Acknowledges every request without touching the physical port
#[derive(Debug, Default, Clone, Copy)]
pub struct AckRequests;

impl RequestOps for AckRequests {}

/// One registered kernel-visible interface
///
/// All methods are non-blocking. Per interface, calls come from a single
/// worker at a time.
pub trait KernelIface: Send + Sync {
    /// Enqueue one buffer toward the kernel
    ///
    /// On refusal (queue full, interface not ready) the buffer is handed back.
    #[allow(clippy::result_large_err)]
    fn send(&self, buf: PoolBuffer) -> Result<(), PoolBuffer>;

    /// Dequeue up to `max` buffers the kernel wants transmitted
    ///
    /// Appends to `out` and returns the number dequeued.
    fn rx_burst(&self, out: &mut Vec<PoolBuffer>, max: usize) -> usize;

    /// Service pending control requests, returns the number handled
    fn handle_requests(&self, ops: &dyn RequestOps) -> usize;
}

/// The host registration subsystem
pub trait KernelBridge {
    type Iface: KernelIface;

    /// One-time initialization with the maximum number of interfaces
    fn init(&mut self, capacity: usize) -> io::Result<()>;

    /// Create and register a virtual interface bound to `pool`
    ///
    /// Must leave nothing registered on failure.
    fn register(&mut self, conf: &IfaceConf, pool: &Arc<BufferPool>) -> io::Result<Self::Iface>;

    /// Deregister an interface
    fn release(&mut self, iface: Self::Iface) -> io::Result<()>;
}

/// A registered interface together with the descriptor it was created from
pub struct BridgeHandle<I> {
    conf: IfaceConf,
    pool: Arc<BufferPool>,
    iface: I,
}

impl<I> BridgeHandle<I> {
    pub fn new(conf: IfaceConf, pool: Arc<BufferPool>, iface: I) -> Self {
        Self { conf, pool, iface }
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn conf(&self) -> &IfaceConf {
        &self.conf
    }

    /// Pool the interface allocates kernel-to-fast-path buffers from
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn iface(&self) -> &I {
        &self.iface
    }

    pub(crate) fn into_iface(self) -> I {
        self.iface
    }
}

impl<I> std::fmt::Debug for BridgeHandle<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("conf", &self.conf)
            .finish()
    }
}
