//! Kernel bridge for a user-space packet fast path
//!
//! For every physical port owned by the fast path, a kernel-visible virtual
//! interface mirroring the port's MTU and MAC is created, so the host stack
//! (ARP, ICMP, routing daemons) sees the traffic the fast path does not
//! handle itself.
//!
//! - [`lifecycle::Bridge`]: `start` / `stop` over a [`port::PortRegistry`]
//! - [`link`]: administrative link-up on the control thread
//! - [`bridge::PortBridge`]: per-port forwarding in the worker poll loop

pub mod allocator;
pub mod bridge;
pub mod config;
pub mod ctl;
pub mod error;
pub mod kernel;
pub mod lifecycle;
pub mod link;
pub mod pool;
pub mod port;
pub mod test_util;
pub mod worker;

pub use bridge::{BridgeStats, PortBridge, StatsSnapshot};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use kernel::{BridgeHandle, IfaceConf, KernelBridge, KernelIface, RequestOps};
pub use lifecycle::Bridge;
pub use port::{Port, PortInfo, PortRegistry};
