//! Virtual interface allocation
//!
//! Builds the registration descriptor for one port from its registry
//! position and a live snapshot of the physical port, then registers it.

use std::sync::Arc;

use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::kernel::{BridgeHandle, IfaceConf, KernelBridge};
use crate::port::{Port, PortInfo};

/// Build the descriptor for the port at registry position `index`
///
/// MTU and MAC are read once here; later changes on the physical port are
/// not propagated.
pub fn iface_conf<I, P: PortInfo + ?Sized>(
    config: &BridgeConfig,
    index: usize,
    port: &Port<I>,
    info: &P,
) -> Result<IfaceConf> {
    let pool = canonical_pool(port)?;

    let mtu = info
        .mtu(port.id())
        .map_err(|e| BridgeError::port_query(port.id(), "MTU", e))?;
    let mac = info
        .mac_addr(port.id())
        .map_err(|e| BridgeError::port_query(port.id(), "MAC address", e))?;

    Ok(IfaceConf {
        name: config.ifname(index),
        group_id: port.id(),
        min_mtu: mtu.min,
        max_mtu: mtu.max,
        mtu: mtu.current,
        mac,
        mbuf_size: pool.data_room(),
    })
}

/// Create the kernel interface for the port at registry position `index`
///
/// The interface is bound to the pool of the port's first worker; every
/// other worker of the port must use a compatible pool. The port itself is
/// not modified.
pub fn allocate<K, P>(
    config: &BridgeConfig,
    index: usize,
    port: &Port<K::Iface>,
    info: &P,
    kernel: &mut K,
) -> Result<BridgeHandle<K::Iface>>
where
    K: KernelBridge,
    P: PortInfo + ?Sized,
{
    let conf = iface_conf(config, index, port, info)?;
    let pool = Arc::clone(canonical_pool(port)?);

    let iface = kernel
        .register(&conf, &pool)
        .map_err(|source| BridgeError::Registration {
            name: conf.name.clone(),
            source,
        })?;

    debug!(
        name = %conf.name,
        port_id = port.id(),
        mtu = conf.mtu,
        "Kernel interface allocated"
    );

    Ok(BridgeHandle::new(conf, pool, iface))
}

fn canonical_pool<I>(port: &Port<I>) -> Result<&Arc<crate::pool::BufferPool>> {
    port.pools().first().ok_or_else(|| {
        BridgeError::Config(format!("port {} has no buffer pool", port.id()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, DEFAULT_BUFFER_SIZE};
    use crate::port::MtuInfo;
    use crate::test_util::{MockIface, MockKernel, MockPortInfo};

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(8, DEFAULT_BUFFER_SIZE).unwrap())
    }

    fn mtu(current: u16) -> MtuInfo {
        MtuInfo {
            min: 68,
            max: 9600,
            current,
        }
    }

    #[test]
    fn test_conf_mirrors_port() {
        let info = MockPortInfo::new();
        info.set_port(42, mtu(1500), MAC);
        let port: Port<MockIface> = Port::new(42, vec![pool()]);

        let conf = iface_conf(&BridgeConfig::default(), 3, &port, &info).unwrap();
        assert_eq!(conf.name, "vEth3");
        assert_eq!(conf.group_id, 42);
        assert_eq!((conf.min_mtu, conf.max_mtu, conf.mtu), (68, 9600, 1500));
        assert_eq!(conf.mac, MAC);
        assert_eq!(conf.mbuf_size, 2048);
    }

    #[test]
    fn test_binds_first_worker_pool() {
        let info = MockPortInfo::new();
        info.set_port(1, mtu(1500), MAC);
        let first = pool();
        let port: Port<MockIface> = Port::new(1, vec![first.clone(), pool()]);
        let mut kernel = MockKernel::new();
        kernel.init(4).unwrap();

        let handle = allocate(&BridgeConfig::default(), 0, &port, &info, &mut kernel).unwrap();
        assert!(Arc::ptr_eq(handle.pool(), &first));
        assert_eq!(kernel.registered_names(), vec!["vEth0".to_string()]);
    }

    #[test]
    fn test_port_query_failures() {
        let info = MockPortInfo::new();
        info.set_port(1, mtu(1500), MAC);
        info.fail_mac(1);
        let port: Port<MockIface> = Port::new(1, vec![pool()]);
        let mut kernel = MockKernel::new();
        kernel.init(4).unwrap();

        let err = allocate(&BridgeConfig::default(), 0, &port, &info, &mut kernel).unwrap_err();
        assert!(matches!(err, BridgeError::PortQuery { port_id: 1, .. }));
        assert!(kernel.registered_names().is_empty());

        // Unknown port: MTU query fails
        let port: Port<MockIface> = Port::new(2, vec![pool()]);
        let err = allocate(&BridgeConfig::default(), 1, &port, &info, &mut kernel).unwrap_err();
        assert!(matches!(err, BridgeError::PortQuery { port_id: 2, what: "MTU", .. }));
    }

    #[test]
    fn test_registration_failure() {
        let info = MockPortInfo::new();
        info.set_port(1, mtu(1500), MAC);
        let port: Port<MockIface> = Port::new(1, vec![pool()]);
        let mut kernel = MockKernel::new();
        kernel.init(4).unwrap();
        kernel.fail_register("vEth0");

        let err = allocate(&BridgeConfig::default(), 0, &port, &info, &mut kernel).unwrap_err();
        assert!(matches!(err, BridgeError::Registration { ref name, .. } if name == "vEth0"));
        assert!(kernel.registered_names().is_empty());
    }

    #[test]
    fn test_port_without_pool() {
        let info = MockPortInfo::new();
        info.set_port(1, mtu(1500), MAC);
        let port: Port<MockIface> = Port::new(1, Vec::new());
        let mut kernel = MockKernel::new();
        kernel.init(4).unwrap();

        let err = allocate(&BridgeConfig::default(), 0, &port, &info, &mut kernel).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
