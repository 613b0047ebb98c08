use std::fs;
use std::path::Path;

use nix::libc::IFNAMSIZ;
use serde::Deserialize;

use crate::error::{BridgeError, Result};

/// Default interface name prefix
pub const DEFAULT_PREFIX: &str = "vEth";

/// Default registration capacity
pub const DEFAULT_MAX_PORTS: usize = 32;

/// Default number of kernel packets drained per poll
pub const DEFAULT_BURST_SIZE: usize = 32;

/// Default number of extra service iterations after a combined bring-up
pub const DEFAULT_LINK_UP_SERVICE_ITERATIONS: usize = 1000;

/// Global bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Whether kernel interfaces are created at all
    pub enabled: bool,
    /// Interface name prefix, the registry index is appended
    pub ifname_prefix: String,
    /// Registration capacity (maximum number of ports)
    pub max_ports: usize,
    /// Maximum packets drained from the kernel per poll
    pub burst_size: usize,
    /// Service iterations run after the link-up thread of `bring_up` finishes
    pub link_up_service_iterations: usize,
    /// Physical ports in registry order
    pub ports: Vec<PortConfig>,
}

/// One physical port under fast-path control
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// Port identifier assigned by the fast path
    pub id: u16,
    /// Host netdev whose MTU and MAC describe the port
    pub netdev: String,
    /// Number of worker threads (one buffer pool each)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    1
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ifname_prefix: DEFAULT_PREFIX.to_string(),
            max_ports: DEFAULT_MAX_PORTS,
            burst_size: DEFAULT_BURST_SIZE,
            link_up_service_iterations: DEFAULT_LINK_UP_SERVICE_ITERATIONS,
            ports: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load a JSON configuration file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        let config: BridgeConfig = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every derived interface name fits IFNAMSIZ and the
    /// limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.ifname_prefix.is_empty() {
            return Err(BridgeError::Config("empty interface name prefix".into()));
        }
        if self.max_ports == 0 {
            return Err(BridgeError::Config("max_ports must be > 0".into()));
        }
        if self.burst_size == 0 {
            return Err(BridgeError::Config("burst_size must be > 0".into()));
        }
        if self.ports.len() > self.max_ports {
            return Err(BridgeError::Config(format!(
                "{} ports configured, capacity is {}",
                self.ports.len(),
                self.max_ports
            )));
        }

        let longest = self.ifname(self.max_ports - 1);
        if longest.len() >= IFNAMSIZ {
            return Err(BridgeError::Config(format!(
                "interface name '{longest}' too long (max {} chars)",
                IFNAMSIZ - 1
            )));
        }

        for (i, port) in self.ports.iter().enumerate() {
            if port.workers == 0 {
                return Err(BridgeError::Config(format!(
                    "port {} (index {i}) has no workers",
                    port.id
                )));
            }
            if self.ports[..i].iter().any(|p| p.id == port.id) {
                return Err(BridgeError::Config(format!("duplicate port id {}", port.id)));
            }
        }

        Ok(())
    }

    /// Interface name for the port at registry position `index`
    pub fn ifname(&self, index: usize) -> String {
        format!("{}{}", self.ifname_prefix, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(config.enabled);
        assert_eq!(config.ifname_prefix, "vEth");
        assert_eq!(config.max_ports, 32);
        assert_eq!(config.burst_size, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ifname_uses_index() {
        let config = BridgeConfig {
            ifname_prefix: "kni".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ifname(0), "kni0");
        assert_eq!(config.ifname(12), "kni12");
    }

    #[test]
    fn test_prefix_too_long() {
        let config = BridgeConfig {
            ifname_prefix: "averyverylongpf".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));

        // 13 chars + "31" = 15 fits
        let config = BridgeConfig {
            ifname_prefix: "averyverylong".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let config = BridgeConfig {
            burst_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BridgeConfig {
            max_ports: 1,
            ports: vec![
                PortConfig {
                    id: 0,
                    netdev: "eth0".into(),
                    workers: 1,
                },
                PortConfig {
                    id: 1,
                    netdev: "eth1".into(),
                    workers: 1,
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_port_id() {
        let port = PortConfig {
            id: 7,
            netdev: "eth0".into(),
            workers: 1,
        };
        let config = BridgeConfig {
            ports: vec![port.clone(), port],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "ifname_prefix": "kni",
                "burst_size": 64,
                "ports": [
                    {{ "id": 5, "netdev": "eth1" }},
                    {{ "id": 2, "netdev": "eth2", "workers": 4 }}
                ]
            }}"#
        )
        .unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert!(config.enabled);
        assert_eq!(config.ifname_prefix, "kni");
        assert_eq!(config.burst_size, 64);
        assert_eq!(config.max_ports, DEFAULT_MAX_PORTS);
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].workers, 1);
        assert_eq!(config.ports[1].workers, 4);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            BridgeConfig::load(file.path()),
            Err(BridgeError::Config(_))
        ));
    }
}
