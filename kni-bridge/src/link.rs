//! Administrative link state of the kernel interfaces
//!
//! Setting `IFF_UP` on a kernel interface makes its kernel side queue control
//! requests (for example the interface-up notification) and wait a bounded
//! time for the answers. Those answers are produced by
//! [`KernelIface::handle_requests`], normally from the per-port poll loop
//! ([`PortBridge::poll`](crate::bridge::PortBridge::poll)).
//!
//! [`link_up`] therefore has a precondition: the poll loop of every bridged
//! port must already be running, or start immediately after the call. Callers
//! that cannot guarantee this use [`bring_up`], which services the requests
//! itself while the link-up sequence runs on a scoped control thread.

use std::io;
use std::thread;

use tracing::{debug, info};

use crate::ctl::ControlSocket;
use crate::error::{BridgeError, Result};
use crate::kernel::{KernelIface, RequestOps};
use crate::port::PortRegistry;

/// Sets the administrative state of an interface
pub trait LinkControl: Sync {
    /// Set `IFF_UP` on `name`, blocking until the kernel has applied it
    fn set_link_up(&self, name: &str) -> io::Result<()>;
}

/// Link control through `SIOCGIFFLAGS` / `SIOCSIFFLAGS`
///
/// Opens and closes a fresh control socket per interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoctlLinkControl;

impl LinkControl for IoctlLinkControl {
    fn set_link_up(&self, name: &str) -> io::Result<()> {
        let sock = ControlSocket::open()?;
        sock.set_up(name)
    }
}

/// Bring every bridged port's interface up, in registry order
///
/// Blocks; call from the control thread, never from a data-plane worker.
/// Ports without a bridge handle are skipped. The first failure aborts the
/// remaining ports. Returns the number of interfaces set up.
///
/// Precondition: the poll loops of the bridged ports are running (see the
/// module documentation).
pub fn link_up<I, L>(ports: &PortRegistry<I>, ctl: &L) -> Result<usize>
where
    L: LinkControl + ?Sized,
{
    let mut count = 0;
    for port in ports {
        let Some(handle) = port.bridge() else {
            continue;
        };

        ctl.set_link_up(handle.name())
            .map_err(|source| BridgeError::LinkControl {
                name: handle.name().to_string(),
                source,
            })?;

        info!(name = %handle.name(), port_id = port.id(), "Kernel interface up");
        count += 1;
    }
    Ok(count)
}

/// [`link_up`] with built-in request servicing
///
/// Runs the link-up sequence on a scoped control thread while the calling
/// thread services the control requests of every bridged port, then keeps
/// servicing for `extra_iterations` rounds to answer late requests. Must not
/// overlap with worker poll loops on the same ports.
pub fn bring_up<I, L>(
    ports: &PortRegistry<I>,
    ctl: &L,
    ops: &dyn RequestOps,
    extra_iterations: usize,
) -> Result<usize>
where
    I: KernelIface,
    L: LinkControl + ?Sized,
{
    thread::scope(|s| {
        let link = thread::Builder::new()
            .name("kni-link-up".to_string())
            .spawn_scoped(s, || link_up(ports, ctl))
            .map_err(|source| BridgeError::LinkControl {
                name: "kni-link-up".to_string(),
                source,
            })?;

        let mut serviced = 0;
        while !link.is_finished() {
            serviced += service_requests(ports, ops);
            thread::yield_now();
        }
        for _ in 0..extra_iterations {
            serviced += service_requests(ports, ops);
        }
        debug!(serviced, "Control requests serviced during bring-up");

        match link.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

/// One servicing round over every bridged port
fn service_requests<I: KernelIface>(ports: &PortRegistry<I>, ops: &dyn RequestOps) -> usize {
    ports
        .iter()
        .filter_map(|port| port.bridge())
        .map(|handle| handle.iface().handle_requests(ops))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_missing_interface() {
        // Fails either on the socket or on SIOCGIFFLAGS, never succeeds
        assert!(IoctlLinkControl.set_link_up("kbr-missing0").is_err());
    }
}
