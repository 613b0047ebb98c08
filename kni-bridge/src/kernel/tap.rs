//! TAP-backed kernel interfaces
//!
//! Each bridge handle is a non-persistent Layer 2 TAP device: Ethernet frames
//! written to the fd appear as received on the interface, frames the kernel
//! transmits on the interface are read back from the fd. Closing the fd
//! removes the device.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use nix::libc;
use tracing::{debug, info, trace};

use super::{IfaceConf, KernelBridge, KernelIface, RequestOps};
use crate::ctl::{ControlSocket, ifreq};
use crate::pool::{BufferPool, PoolBuffer};

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// TAP registration subsystem
#[derive(Debug, Default)]
pub struct TapKernel {
    capacity: Option<usize>,
    registered: usize,
}

impl TapKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently registered interfaces
    pub fn registered(&self) -> usize {
        self.registered
    }
}

impl KernelBridge for TapKernel {
    type Iface = TapIface;

    fn init(&mut self, capacity: usize) -> io::Result<()> {
        if self.capacity.is_none() {
            self.capacity = Some(capacity);
            debug!(capacity, "TAP bridge initialized");
        }
        Ok(())
    }

    fn register(&mut self, conf: &IfaceConf, pool: &Arc<BufferPool>) -> io::Result<TapIface> {
        let capacity = self
            .capacity
            .ok_or_else(|| io::Error::other("TAP bridge not initialized"))?;
        if self.registered >= capacity {
            return Err(io::Error::other(format!(
                "interface capacity {capacity} exhausted"
            )));
        }

        let iface = TapIface::create(conf, Arc::clone(pool))?;
        self.registered += 1;
        Ok(iface)
    }

    fn release(&mut self, iface: TapIface) -> io::Result<()> {
        self.registered = self.registered.saturating_sub(1);
        debug!(name = %iface.name, "TAP device released");
        drop(iface);
        Ok(())
    }
}

/// One TAP device
pub struct TapIface {
    name: String,
    file: File,
    pool: Arc<BufferPool>,
}

impl TapIface {
    /// Create the TAP device and mirror MTU and MAC onto it
    ///
    /// The device is gone again if any step fails, since the fd is dropped.
    fn create(conf: &IfaceConf, pool: Arc<BufferPool>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr = ifreq(&conf.name)?;
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: ifr is a valid ifreq naming the device to create
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                TUNSETIFF as libc::Ioctl,
                &mut ifr as *mut libc::ifreq,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let sock = ControlSocket::open()?;
        sock.set_mtu(&conf.name, conf.mtu)?;
        sock.set_hwaddr(&conf.name, conf.mac)?;

        info!(
            name = %conf.name,
            mtu = conf.mtu,
            group_id = conf.group_id,
            "TAP device created"
        );

        Ok(Self {
            name: conf.name.clone(),
            file,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl KernelIface for TapIface {
    fn send(&self, buf: PoolBuffer) -> Result<(), PoolBuffer> {
        match (&self.file).write(buf.data()) {
            Ok(_) => Ok(()),
            Err(e) => {
                trace!(name = %self.name, error = %e, "TAP write refused");
                Err(buf)
            }
        }
    }

    fn rx_burst(&self, out: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let Some(mut buf) = self.pool.alloc() else {
                break;
            };
            match (&self.file).read(buf.write_area()) {
                Ok(0) => break,
                Ok(len) => {
                    buf.set_len(len);
                    out.push(buf);
                    n += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    trace!(name = %self.name, error = %e, "TAP read failed");
                    break;
                }
            }
        }
        n
    }

    /// TAP devices have no kernel request channel
    fn handle_requests(&self, _ops: &dyn RequestOps) -> usize {
        0
    }
}

impl Drop for TapIface {
    fn drop(&mut self) {
        debug!(name = %self.name, "TAP device closed");
    }
}
