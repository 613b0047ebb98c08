//! Link-up of kernel interfaces, with and without request servicing

use std::io;
use std::sync::Arc;
use std::time::Duration;

use kni_bridge::kernel::{AckRequests, KernelRequest};
use kni_bridge::link;
use kni_bridge::pool::PoolBuffer;
use kni_bridge::port::MtuInfo;
use kni_bridge::test_util::{MockIface, MockKernel, MockLinkControl, registry_with_ports};
use kni_bridge::worker::spawn_worker;
use kni_bridge::{Bridge, BridgeConfig, BridgeError, PortRegistry};

const MTU: MtuInfo = MtuInfo {
    min: 68,
    max: 9000,
    current: 1500,
};

fn started(ids: &[u16], kernel: &MockKernel) -> PortRegistry<MockIface> {
    let (mut registry, info) = registry_with_ports(ids, 8, MTU);
    let mut bridge = Bridge::new(BridgeConfig::default(), kernel.clone(), info);
    bridge.start(&mut registry).unwrap();
    registry
}

#[test]
fn test_link_up_all_in_order() {
    let kernel = MockKernel::new();
    let registry = started(&[9, 4, 1], &kernel);
    let ctl = MockLinkControl::new();

    assert_eq!(link::link_up(&registry, &ctl).unwrap(), 3);
    assert_eq!(ctl.calls(), vec!["vEth0", "vEth1", "vEth2"]);
}

#[test]
fn test_link_up_skips_unbridged_ports() {
    let kernel = MockKernel::new();
    kernel.fail_register("vEth1");
    let (mut registry, info) = registry_with_ports(&[0, 1], 8, MTU);
    let mut bridge = Bridge::new(BridgeConfig::default(), kernel.clone(), info);
    assert!(bridge.start(&mut registry).is_err());

    let ctl = MockLinkControl::new();
    assert_eq!(link::link_up(&registry, &ctl).unwrap(), 1);
    assert_eq!(ctl.calls(), vec!["vEth0"]);
}

#[test]
fn test_link_up_stops_at_first_failure() {
    let kernel = MockKernel::new();
    let registry = started(&[0, 1, 2], &kernel);
    let ctl = MockLinkControl::new().fail_on("vEth1");

    let err = link::link_up(&registry, &ctl).unwrap_err();
    assert!(matches!(err, BridgeError::LinkControl { ref name, .. } if name == "vEth1"));
    assert_eq!(ctl.calls(), vec!["vEth0", "vEth1"]);
}

#[test]
fn test_link_up_times_out_without_servicing() {
    let kernel = MockKernel::new();
    let registry = started(&[0], &kernel);
    let ctl = MockLinkControl::with_handshake(kernel.clone(), Duration::from_millis(50));

    let err = link::link_up(&registry, &ctl).unwrap_err();
    match err {
        BridgeError::LinkControl { name, source } => {
            assert_eq!(name, "vEth0");
            assert_eq!(source.kind(), io::ErrorKind::TimedOut);
        }
        other => panic!("unexpected error: {other}"),
    }

    let queues = kernel.queues("vEth0").unwrap();
    assert_eq!(queues.pending_requests(), 1);
    assert!(queues.answers().is_empty());
}

#[test]
fn test_bring_up_services_requests() {
    let kernel = MockKernel::new();
    let registry = started(&[0, 1], &kernel);
    let ctl = MockLinkControl::with_handshake(kernel.clone(), Duration::from_secs(5));
    let bridge = Bridge::new(
        BridgeConfig {
            link_up_service_iterations: 10,
            ..BridgeConfig::default()
        },
        kernel.clone(),
        kni_bridge::test_util::MockPortInfo::new(),
    );

    assert_eq!(bridge.bring_up(&registry, &ctl, &AckRequests).unwrap(), 2);

    for name in ["vEth0", "vEth1"] {
        let queues = kernel.queues(name).unwrap();
        assert_eq!(
            queues.answers(),
            vec![(KernelRequest::ConfigNetworkIf { up: true }, None)]
        );
        assert!(queues.service_calls() >= 10);
    }
}

#[test]
fn test_link_up_with_running_worker() {
    let kernel = MockKernel::new();
    let registry = Arc::new(started(&[3], &kernel));
    let worker = spawn_worker(Arc::clone(&registry), 0, 32, |_buf: PoolBuffer| {}).unwrap();

    let ctl = MockLinkControl::with_handshake(kernel.clone(), Duration::from_secs(5));
    assert_eq!(link::link_up(&registry, &ctl).unwrap(), 1);

    worker.stop();
    worker.join().unwrap();

    let queues = kernel.queues("vEth0").unwrap();
    assert_eq!(queues.answers().len(), 1);
}

#[test]
fn test_disabled_link_up_is_noop() {
    let kernel = MockKernel::new();
    let registry = started(&[0], &kernel);
    let bridge = Bridge::new(
        BridgeConfig {
            enabled: false,
            ..BridgeConfig::default()
        },
        kernel.clone(),
        kni_bridge::test_util::MockPortInfo::new(),
    );
    let ctl = MockLinkControl::new();

    assert_eq!(bridge.link_up(&registry, &ctl).unwrap(), 0);
    assert_eq!(bridge.bring_up(&registry, &ctl, &AckRequests).unwrap(), 0);
    assert!(ctl.calls().is_empty());
}
