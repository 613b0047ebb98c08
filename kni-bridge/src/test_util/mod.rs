//! In-memory stand-ins for the host side of the bridge
//!
//! Used by unit and integration tests to drive the bridge without
//! CAP_NET_ADMIN:
//! - `MockKernel` / `MockIface`: registration subsystem and queue pair
//! - `MockPortInfo`: physical port MTU/MAC with failure injection
//! - `MockLinkControl`: link-up with an optional request handshake

pub mod mock;

pub use mock::{
    MockIface, MockKernel, MockLinkControl, MockPortInfo, MockQueues, registry_with_ports,
};
