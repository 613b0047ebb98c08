//! Bridge lifecycle: create-all at startup, release-all at shutdown
//!
//! `start` stops at the first failing port. `stop` attempts every port and
//! collects the failures.

use tracing::{debug, info, warn};

use crate::allocator;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::kernel::{KernelBridge, RequestOps};
use crate::link::{self, LinkControl};
use crate::port::{PortInfo, PortRegistry};

/// Owns the registration subsystem and drives it over a port registry
pub struct Bridge<K, P> {
    config: BridgeConfig,
    kernel: K,
    info: P,
    /// Set once the registration subsystem has been initialized
    initialized: bool,
}

impl<K, P> Bridge<K, P>
where
    K: KernelBridge,
    P: PortInfo,
{
    pub fn new(config: BridgeConfig, kernel: K, info: P) -> Self {
        Self {
            config,
            kernel,
            info,
            initialized: false,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Create a kernel interface for every port, in registry order
    ///
    /// Does nothing when bridging is disabled. The registration subsystem is
    /// initialized on the first call with `max_ports` as its capacity. The
    /// first failure is returned and no further port is touched; ports
    /// allocated before it keep their handles until [`stop`](Self::stop).
    /// Ports that already hold a handle are left as they are.
    pub fn start(&mut self, ports: &mut PortRegistry<K::Iface>) -> Result<()> {
        if !self.config.enabled {
            debug!("Kernel bridge disabled");
            return Ok(());
        }

        if ports.len() > self.config.max_ports {
            return Err(BridgeError::Config(format!(
                "{} ports exceed bridge capacity {}",
                ports.len(),
                self.config.max_ports
            )));
        }

        if !self.initialized {
            self.kernel
                .init(self.config.max_ports)
                .map_err(BridgeError::Init)?;
            self.initialized = true;
        }

        let mut created = 0;
        for (index, port) in ports.iter_mut().enumerate() {
            if port.bridge.is_some() {
                continue;
            }

            let handle =
                allocator::allocate(&self.config, index, port, &self.info, &mut self.kernel)?;
            port.bridge = Some(handle);
            created += 1;
        }

        info!(created, ports = ports.len(), "Kernel bridge started");
        Ok(())
    }

    /// Release every kernel interface
    ///
    /// Does nothing when bridging is disabled. Every handle is taken off its
    /// port whether or not the release succeeds; failures are logged and
    /// returned, they do not stop the remaining releases.
    ///
    /// Workers must no longer be bridging these ports.
    pub fn stop(&mut self, ports: &mut PortRegistry<K::Iface>) -> Vec<BridgeError> {
        let mut errors = Vec::new();
        if !self.config.enabled {
            return errors;
        }

        let mut released = 0;
        for port in ports.iter_mut() {
            let Some(handle) = port.bridge.take() else {
                continue;
            };
            let name = handle.name().to_string();

            match self.kernel.release(handle.into_iface()) {
                Ok(()) => released += 1,
                Err(source) => {
                    warn!(name = %name, port_id = port.id(), error = %source, "Failed to release kernel interface");
                    errors.push(BridgeError::Release { name, source });
                }
            }
        }

        info!(released, failed = errors.len(), "Kernel bridge stopped");
        errors
    }

    /// Bring all kernel interfaces up; see [`link::link_up`]
    ///
    /// Control thread only, and the workers' poll loops must be running.
    pub fn link_up<L>(&self, ports: &PortRegistry<K::Iface>, ctl: &L) -> Result<usize>
    where
        L: LinkControl + ?Sized,
    {
        if !self.config.enabled {
            return Ok(0);
        }
        link::link_up(ports, ctl)
    }

    /// Bring all kernel interfaces up while servicing their control
    /// requests; see [`link::bring_up`]
    pub fn bring_up<L>(
        &self,
        ports: &PortRegistry<K::Iface>,
        ctl: &L,
        ops: &dyn RequestOps,
    ) -> Result<usize>
    where
        L: LinkControl + ?Sized,
    {
        if !self.config.enabled {
            return Ok(0);
        }
        link::bring_up(ports, ctl, ops, self.config.link_up_service_iterations)
    }
}
