//! Physical ports and their registry
//!
//! The registry owns the ports in configuration order. A port's position in
//! that order is its registry index, which names its kernel interface; the
//! port id is whatever the fast path assigned and plays no part in naming.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;

use crate::ctl::ControlSocket;
use crate::kernel::BridgeHandle;
use crate::pool::BufferPool;

/// Smallest MTU an Ethernet netdev accepts (ETH_MIN_MTU)
pub const ETH_MIN_MTU: u16 = 68;

/// Largest MTU reported for netdevs without a tighter bound, and the
/// ceiling every reported MTU saturates to
pub const ETH_MAX_MTU: u16 = 0xffff;

/// MTU limits and current MTU of a physical port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuInfo {
    pub min: u16,
    pub max: u16,
    pub current: u16,
}

/// Live queries against physical ports
pub trait PortInfo {
    fn mtu(&self, port_id: u16) -> io::Result<MtuInfo>;
    fn mac_addr(&self, port_id: u16) -> io::Result<[u8; 6]>;
}

/// A physical port under fast-path control
pub struct Port<I> {
    id: u16,
    /// One pool per worker thread serving this port
    pools: Vec<Arc<BufferPool>>,
    pub(crate) bridge: Option<BridgeHandle<I>>,
}

impl<I> Port<I> {
    pub fn new(id: u16, pools: Vec<Arc<BufferPool>>) -> Self {
        Self {
            id,
            pools,
            bridge: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn pools(&self) -> &[Arc<BufferPool>] {
        &self.pools
    }

    /// The kernel interface of this port, if bridging created one
    pub fn bridge(&self) -> Option<&BridgeHandle<I>> {
        self.bridge.as_ref()
    }

    pub fn has_bridge(&self) -> bool {
        self.bridge.is_some()
    }
}

impl<I> std::fmt::Debug for Port<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("pools", &self.pools.len())
            .field("bridge", &self.bridge.as_ref().map(|b| b.conf().name.as_str()))
            .finish()
    }
}

/// Ports in configuration order
pub struct PortRegistry<I> {
    ports: Vec<Port<I>>,
}

impl<I> PortRegistry<I> {
    pub fn new(ports: Vec<Port<I>>) -> Self {
        Self { ports }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Port<I>> {
        self.ports.get(index)
    }

    /// Ports in registry order
    pub fn iter(&self) -> std::slice::Iter<'_, Port<I>> {
        self.ports.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Port<I>> {
        self.ports.iter_mut()
    }

    /// Number of ports currently holding a bridge handle
    pub fn bridged(&self) -> usize {
        self.ports.iter().filter(|p| p.has_bridge()).count()
    }
}

impl<'a, I> IntoIterator for &'a PortRegistry<I> {
    type Item = &'a Port<I>;
    type IntoIter = std::slice::Iter<'a, Port<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ports.iter()
    }
}

/// Port queries answered from host netdevs
///
/// Each port id maps to a netdev name. MTU limits and current MTU come from
/// an `RTM_GETLINK` request for the netdev, the MAC from `SIOCGIFHWADDR`;
/// both are read on every query.
///
/// Each MTU query runs its own netlink connection on a throwaway
/// current-thread runtime, so it must not be called from inside a tokio
/// runtime.
#[derive(Debug, Default)]
pub struct NetdevPortInfo {
    netdevs: HashMap<u16, String>,
}

impl NetdevPortInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port_id: u16, netdev: impl Into<String>) {
        self.netdevs.insert(port_id, netdev.into());
    }

    fn netdev(&self, port_id: u16) -> io::Result<&str> {
        self.netdevs
            .get(&port_id)
            .map(String::as_str)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown port {port_id}")))
    }
}

/// Fetch the link attributes of `name` over rtnetlink
fn link_attributes(name: &str) -> io::Result<Vec<LinkAttribute>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    rt.block_on(async {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(io::Error::other)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no link '{name}'")))?;
        Ok::<_, io::Error>(link.attributes)
    })
}

/// MTU limits and current MTU from a link's attributes
///
/// A missing or zero limit means the driver sets none and falls back to the
/// Ethernet bound. Values above 65535 saturate.
pub fn mtu_from_attributes(attrs: &[LinkAttribute]) -> io::Result<MtuInfo> {
    let saturate = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);

    let mut current = None;
    let mut min = 0;
    let mut max = 0;
    for attr in attrs {
        match attr {
            LinkAttribute::Mtu(v) => current = Some(saturate(*v)),
            LinkAttribute::MinMtu(v) => min = saturate(*v),
            LinkAttribute::MaxMtu(v) => max = saturate(*v),
            _ => {}
        }
    }

    let current = current.ok_or_else(|| io::Error::other("link reports no MTU"))?;
    let min = if min == 0 { ETH_MIN_MTU } else { min };
    let max = if max == 0 { ETH_MAX_MTU } else { max };
    Ok(MtuInfo { min, max, current })
}

impl PortInfo for NetdevPortInfo {
    fn mtu(&self, port_id: u16) -> io::Result<MtuInfo> {
        let name = self.netdev(port_id)?;
        mtu_from_attributes(&link_attributes(name)?)
    }

    fn mac_addr(&self, port_id: u16) -> io::Result<[u8; 6]> {
        let name = self.netdev(port_id)?;
        ControlSocket::open()?.hwaddr(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DEFAULT_BUFFER_SIZE;
    use crate::test_util::MockIface;

    #[test]
    fn test_registry_order() {
        let pool = Arc::new(BufferPool::new(2, DEFAULT_BUFFER_SIZE).unwrap());
        let registry: PortRegistry<MockIface> = PortRegistry::new(vec![
            Port::new(9, vec![pool.clone()]),
            Port::new(4, vec![pool.clone()]),
            Port::new(7, vec![pool]),
        ]);

        let ids: Vec<u16> = registry.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![9, 4, 7]);
        assert_eq!(registry.get(1).map(|p| p.id()), Some(4));
        assert_eq!(registry.bridged(), 0);
        assert!(registry.iter().all(|p| p.bridge().is_none()));
    }

    #[test]
    fn test_netdev_unknown_port() {
        let info = NetdevPortInfo::new();
        let err = info.mtu(3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(info.mac_addr(3).is_err());
    }

    #[test]
    fn test_mtu_bounds_from_link() {
        let mtu = mtu_from_attributes(&[
            LinkAttribute::Mtu(1500),
            LinkAttribute::MinMtu(1280),
            LinkAttribute::MaxMtu(9000),
        ])
        .unwrap();
        assert_eq!(
            mtu,
            MtuInfo {
                min: 1280,
                max: 9000,
                current: 1500
            }
        );
    }

    #[test]
    fn test_mtu_unset_bounds_fall_back() {
        // ifb reports minmtu 0 maxmtu 0
        let mtu = mtu_from_attributes(&[
            LinkAttribute::Mtu(1500),
            LinkAttribute::MinMtu(0),
            LinkAttribute::MaxMtu(0),
        ])
        .unwrap();
        assert_eq!((mtu.min, mtu.max), (ETH_MIN_MTU, ETH_MAX_MTU));

        let mtu = mtu_from_attributes(&[LinkAttribute::Mtu(1500)]).unwrap();
        assert_eq!((mtu.min, mtu.max), (ETH_MIN_MTU, ETH_MAX_MTU));
    }

    #[test]
    fn test_mtu_saturates_above_u16() {
        // Loopback defaults to 65536
        let mtu = mtu_from_attributes(&[LinkAttribute::Mtu(65536), LinkAttribute::MaxMtu(0)])
            .unwrap();
        assert_eq!(mtu.current, u16::MAX);
        assert_eq!(mtu.max, ETH_MAX_MTU);
    }

    #[test]
    fn test_mtu_missing() {
        assert!(mtu_from_attributes(&[LinkAttribute::MinMtu(68)]).is_err());
    }

    #[test]
    fn test_loopback_mtu() {
        let mut info = NetdevPortInfo::new();
        info.insert(0, "lo");
        // Netlink may be unavailable in a sandbox
        let Ok(mtu) = info.mtu(0) else {
            return;
        };
        assert!(mtu.current >= ETH_MIN_MTU);
        assert!(mtu.min <= mtu.max);
    }
}
