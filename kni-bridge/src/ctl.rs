//! Interface control socket
//!
//! Thin wrapper around the `SIOC*IF*` ioctls on an `AF_INET` datagram socket,
//! the same sequence `ip link` falls back to. Every call blocks in the kernel,
//! so nothing in here may run on a data-plane worker.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::libc;

/// A control socket, closed on drop
pub struct ControlSocket {
    fd: OwnedFd,
}

impl ControlSocket {
    /// Open a new control socket
    pub fn open() -> io::Result<Self> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: sock is a freshly created descriptor we own
        let fd = unsafe { OwnedFd::from_raw_fd(sock) };
        Ok(Self { fd })
    }

    /// Read the interface flags (`SIOCGIFFLAGS`)
    pub fn flags(&self, name: &str) -> io::Result<libc::c_short> {
        let mut ifr = ifreq(name)?;
        self.ioctl(libc::SIOCGIFFLAGS as libc::Ioctl, &mut ifr)?;
        // SAFETY: SIOCGIFFLAGS fills the flags member
        Ok(unsafe { ifr.ifr_ifru.ifru_flags })
    }

    /// Write the interface flags (`SIOCSIFFLAGS`)
    pub fn set_flags(&self, name: &str, flags: libc::c_short) -> io::Result<()> {
        let mut ifr = ifreq(name)?;
        ifr.ifr_ifru.ifru_flags = flags;
        self.ioctl(libc::SIOCSIFFLAGS as libc::Ioctl, &mut ifr)
    }

    /// Set `IFF_UP`, keeping every other flag as it is
    pub fn set_up(&self, name: &str) -> io::Result<()> {
        let flags = self.flags(name)?;
        self.set_flags(name, flags | libc::IFF_UP as libc::c_short)
    }

    pub fn set_mtu(&self, name: &str, mtu: u16) -> io::Result<()> {
        let mut ifr = ifreq(name)?;
        ifr.ifr_ifru.ifru_mtu = libc::c_int::from(mtu);
        self.ioctl(libc::SIOCSIFMTU as libc::Ioctl, &mut ifr)
    }

    /// Read the Ethernet hardware address (`SIOCGIFHWADDR`)
    pub fn hwaddr(&self, name: &str) -> io::Result<[u8; 6]> {
        let mut ifr = ifreq(name)?;
        self.ioctl(libc::SIOCGIFHWADDR as libc::Ioctl, &mut ifr)?;
        // SAFETY: SIOCGIFHWADDR fills the hwaddr member
        let sa = unsafe { ifr.ifr_ifru.ifru_hwaddr };
        let mut mac = [0u8; 6];
        for (dst, src) in mac.iter_mut().zip(sa.sa_data.iter()) {
            *dst = *src as u8;
        }
        Ok(mac)
    }

    /// Set the Ethernet hardware address (`SIOCSIFHWADDR`)
    pub fn set_hwaddr(&self, name: &str, mac: [u8; 6]) -> io::Result<()> {
        let mut ifr = ifreq(name)?;
        // SAFETY: writing plain data into the zeroed union
        unsafe {
            ifr.ifr_ifru.ifru_hwaddr.sa_family = libc::ARPHRD_ETHER;
            for (dst, src) in ifr.ifr_ifru.ifru_hwaddr.sa_data.iter_mut().zip(mac) {
                *dst = src as libc::c_char;
            }
        }
        self.ioctl(libc::SIOCSIFHWADDR as libc::Ioctl, &mut ifr)
    }

    fn ioctl(&self, request: libc::Ioctl, ifr: &mut libc::ifreq) -> io::Result<()> {
        // SAFETY: ifr is a valid, initialized ifreq for the request
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request, ifr as *mut libc::ifreq) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Zeroed ifreq with `ifr_name` set
pub(crate) fn ifreq(name: &str) -> io::Result<libc::ifreq> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name '{name}' (max {} chars)", libc::IFNAMSIZ - 1),
        ));
    }

    // SAFETY: ifreq is plain old data, all-zero is a valid value
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }
    Ok(ifr)
}
