//! Error types for the kernel bridge.

use std::io;
use thiserror::Error;

/// Bridge errors.
///
/// Forwarding refusals are not represented here: the data path hands the
/// refused buffer back and drops it instead of returning an error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid bridge configuration: {0}")]
    Config(String),

    #[error("Failed to initialize kernel bridge: {0}")]
    Init(#[source] io::Error),

    #[error("Failed to query {what} of port {port_id}: {source}")]
    PortQuery {
        port_id: u16,
        what: &'static str,
        source: io::Error,
    },

    #[error("Failed to register interface '{name}': {source}")]
    Registration { name: String, source: io::Error },

    #[error("Failed to set link up on '{name}': {source}")]
    LinkControl { name: String, source: io::Error },

    #[error("Failed to release interface '{name}': {source}")]
    Release { name: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn port_query(port_id: u16, what: &'static str, source: io::Error) -> Self {
        BridgeError::PortQuery {
            port_id,
            what,
            source,
        }
    }
}
