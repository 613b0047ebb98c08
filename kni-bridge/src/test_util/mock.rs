use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::kernel::{IfaceConf, KernelBridge, KernelIface, KernelRequest, RequestOps};
use crate::link::LinkControl;
use crate::pool::{BufferPool, PoolBuffer};
use crate::port::{MtuInfo, Port, PortInfo, PortRegistry};

/// Default depth of each mock queue
pub const MOCK_QUEUE_DEPTH: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The queue pair and request channel of one mock interface
///
/// `to_kernel` holds what the bridge sent to the kernel, `from_kernel` what
/// the kernel wants transmitted.
pub struct MockQueues {
    conf: IfaceConf,
    to_kernel: ArrayQueue<PoolBuffer>,
    from_kernel: ArrayQueue<PoolBuffer>,
    requests: SegQueue<KernelRequest>,
    answers: Mutex<Vec<(KernelRequest, Option<i32>)>>,
    service_calls: AtomicUsize,
    ready: AtomicBool,
}

impl MockQueues {
    fn new(conf: IfaceConf, depth: usize) -> Self {
        Self {
            conf,
            to_kernel: ArrayQueue::new(depth),
            from_kernel: ArrayQueue::new(depth),
            requests: SegQueue::new(),
            answers: Mutex::new(Vec::new()),
            service_calls: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
        }
    }

    pub fn conf(&self) -> &IfaceConf {
        &self.conf
    }

    /// Refuse every send while not ready
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Take the next buffer the bridge delivered to the kernel
    pub fn kernel_receive(&self) -> Option<PoolBuffer> {
        self.to_kernel.pop()
    }

    /// Queue a buffer for transmission by the fast path
    #[allow(clippy::result_large_err)]
    pub fn kernel_transmit(&self, buf: PoolBuffer) -> Result<(), PoolBuffer> {
        self.from_kernel.push(buf)
    }

    /// Echo everything delivered to the kernel back as kernel transmissions
    pub fn loopback(&self) -> usize {
        let mut n = 0;
        while let Some(buf) = self.to_kernel.pop() {
            if self.from_kernel.push(buf).is_err() {
                break;
            }
            n += 1;
        }
        n
    }

    pub fn to_kernel_len(&self) -> usize {
        self.to_kernel.len()
    }

    pub fn from_kernel_len(&self) -> usize {
        self.from_kernel.len()
    }

    pub fn queue_request(&self, req: KernelRequest) {
        self.requests.push(req);
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Answered requests with their result (`None` = success, else errno)
    pub fn answers(&self) -> Vec<(KernelRequest, Option<i32>)> {
        lock(&self.answers).clone()
    }

    /// Number of `handle_requests` calls
    pub fn service_calls(&self) -> usize {
        self.service_calls.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`MockKernel::register`]
pub struct MockIface {
    queues: Arc<MockQueues>,
}

impl MockIface {
    pub fn queues(&self) -> &Arc<MockQueues> {
        &self.queues
    }
}

impl KernelIface for MockIface {
    fn send(&self, buf: PoolBuffer) -> Result<(), PoolBuffer> {
        if !self.queues.ready.load(Ordering::SeqCst) {
            return Err(buf);
        }
        self.queues.to_kernel.push(buf)
    }

    fn rx_burst(&self, out: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let Some(buf) = self.queues.from_kernel.pop() else {
                break;
            };
            out.push(buf);
            n += 1;
        }
        n
    }

    fn handle_requests(&self, ops: &dyn RequestOps) -> usize {
        self.queues.service_calls.fetch_add(1, Ordering::SeqCst);
        let mut n = 0;
        while let Some(req) = self.queues.requests.pop() {
            let result = req
                .dispatch(ops, self.queues.conf.group_id)
                .err()
                .map(|e| e.raw_os_error().unwrap_or(nix::libc::EIO));
            lock(&self.queues.answers).push((req, result));
            n += 1;
        }
        n
    }
}

#[derive(Default)]
struct KernelState {
    init_calls: Vec<usize>,
    capacity: Option<usize>,
    registered: Vec<String>,
    released: Vec<String>,
    release_attempts: Vec<String>,
    fail_register: HashSet<String>,
    fail_release: HashSet<String>,
    queues: HashMap<String, Arc<MockQueues>>,
}

/// In-memory registration subsystem
///
/// Clones share state, so a test can keep a clone after moving one into a
/// [`Bridge`](crate::lifecycle::Bridge).
#[derive(Clone)]
pub struct MockKernel {
    state: Arc<Mutex<KernelState>>,
    depth: usize,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    pub fn new() -> Self {
        Self::with_depth(MOCK_QUEUE_DEPTH)
    }

    /// Mock whose interfaces have queues of `depth` buffers
    pub fn with_depth(depth: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState::default())),
            depth,
        }
    }

    pub fn fail_register(&self, name: &str) {
        lock(&self.state).fail_register.insert(name.to_string());
    }

    pub fn fail_release(&self, name: &str) {
        lock(&self.state).fail_release.insert(name.to_string());
    }

    /// Capacities passed to `init`, one entry per call
    pub fn init_calls(&self) -> Vec<usize> {
        lock(&self.state).init_calls.clone()
    }

    /// Currently registered interfaces, in registration order
    pub fn registered_names(&self) -> Vec<String> {
        lock(&self.state).registered.clone()
    }

    /// Successfully released interfaces, in release order
    pub fn released_names(&self) -> Vec<String> {
        lock(&self.state).released.clone()
    }

    /// Every release call, failed or not
    pub fn release_attempts(&self) -> Vec<String> {
        lock(&self.state).release_attempts.clone()
    }

    pub fn queues(&self, name: &str) -> Option<Arc<MockQueues>> {
        lock(&self.state).queues.get(name).cloned()
    }
}

impl KernelBridge for MockKernel {
    type Iface = MockIface;

    fn init(&mut self, capacity: usize) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.init_calls.push(capacity);
        if state.capacity.is_none() {
            state.capacity = Some(capacity);
        }
        Ok(())
    }

    fn register(&mut self, conf: &IfaceConf, _pool: &Arc<BufferPool>) -> io::Result<MockIface> {
        let mut state = lock(&self.state);
        let capacity = state
            .capacity
            .ok_or_else(|| io::Error::other("not initialized"))?;
        if state.fail_register.contains(&conf.name) {
            return Err(io::Error::from_raw_os_error(nix::libc::EEXIST));
        }
        if state.registered.len() >= capacity {
            return Err(io::Error::other("capacity exhausted"));
        }

        let queues = Arc::new(MockQueues::new(conf.clone(), self.depth));
        state.registered.push(conf.name.clone());
        state.queues.insert(conf.name.clone(), Arc::clone(&queues));
        Ok(MockIface { queues })
    }

    fn release(&mut self, iface: MockIface) -> io::Result<()> {
        let name = iface.queues.conf.name.clone();
        let mut state = lock(&self.state);
        state.release_attempts.push(name.clone());
        if state.fail_release.contains(&name) {
            return Err(io::Error::from_raw_os_error(nix::libc::EBUSY));
        }
        state.registered.retain(|n| *n != name);
        state.released.push(name);
        Ok(())
    }
}

#[derive(Default)]
struct PortState {
    ports: HashMap<u16, (MtuInfo, [u8; 6])>,
    fail_mtu: HashSet<u16>,
    fail_mac: HashSet<u16>,
}

/// Physical port answers with failure injection; clones share state
#[derive(Clone, Default)]
pub struct MockPortInfo {
    state: Arc<Mutex<PortState>>,
}

impl MockPortInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or change) what port `id` reports
    pub fn set_port(&self, id: u16, mtu: MtuInfo, mac: [u8; 6]) {
        lock(&self.state).ports.insert(id, (mtu, mac));
    }

    pub fn fail_mtu(&self, id: u16) {
        lock(&self.state).fail_mtu.insert(id);
    }

    pub fn fail_mac(&self, id: u16) {
        lock(&self.state).fail_mac.insert(id);
    }
}

impl PortInfo for MockPortInfo {
    fn mtu(&self, port_id: u16) -> io::Result<MtuInfo> {
        let state = lock(&self.state);
        if state.fail_mtu.contains(&port_id) {
            return Err(io::Error::from_raw_os_error(nix::libc::ENODEV));
        }
        state
            .ports
            .get(&port_id)
            .map(|(mtu, _)| *mtu)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn mac_addr(&self, port_id: u16) -> io::Result<[u8; 6]> {
        let state = lock(&self.state);
        if state.fail_mac.contains(&port_id) {
            return Err(io::Error::from_raw_os_error(nix::libc::ENODEV));
        }
        state
            .ports
            .get(&port_id)
            .map(|(_, mac)| *mac)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

/// Link control that records calls
///
/// With a handshake, setting an interface up queues an interface-up request
/// on its mock queues and waits until that request is answered, failing with
/// `TimedOut` after the deadline, like a kernel interface whose requests go
/// unserviced.
#[derive(Default)]
pub struct MockLinkControl {
    calls: Mutex<Vec<String>>,
    fail: HashSet<String>,
    handshake: Option<(MockKernel, Duration)>,
}

impl MockLinkControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake(kernel: MockKernel, deadline: Duration) -> Self {
        Self {
            handshake: Some((kernel, deadline)),
            ..Self::default()
        }
    }

    pub fn fail_on(mut self, name: &str) -> Self {
        self.fail.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl LinkControl for MockLinkControl {
    fn set_link_up(&self, name: &str) -> io::Result<()> {
        lock(&self.calls).push(name.to_string());
        if self.fail.contains(name) {
            return Err(io::Error::from_raw_os_error(nix::libc::EPERM));
        }

        let Some((kernel, deadline)) = &self.handshake else {
            return Ok(());
        };
        let queues = kernel
            .queues(name)
            .ok_or_else(|| io::Error::from_raw_os_error(nix::libc::ENODEV))?;

        let request = KernelRequest::ConfigNetworkIf { up: true };
        let answered_before = queues.answers().len();
        queues.queue_request(request);

        let start = Instant::now();
        while start.elapsed() < *deadline {
            if queues.answers().len() > answered_before {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(io::Error::from(io::ErrorKind::TimedOut))
    }
}

/// Registry of ports with the given ids, each with one pool of `buffers`
/// buffers, and port info reporting `mtu` and a MAC derived from the id
pub fn registry_with_ports(
    ids: &[u16],
    buffers: usize,
    mtu: MtuInfo,
) -> (PortRegistry<MockIface>, MockPortInfo) {
    let info = MockPortInfo::new();
    let ports = ids
        .iter()
        .map(|&id| {
            info.set_port(id, mtu, [0x02, 0, 0, 0, (id >> 8) as u8, id as u8]);
            let pool = Arc::new(
                BufferPool::new(buffers, crate::pool::DEFAULT_BUFFER_SIZE)
                    .unwrap_or_else(|e| panic!("Failed to create pool: {e}")),
            );
            Port::new(id, vec![pool])
        })
        .collect();
    (PortRegistry::new(ports), info)
}
