use crate::devices::NetDevice;
use crate::error::NetError;
use crate::protocols::arp::ArpTable;
use crate::protocols::ip::IpContext;
use crate::protocols::{NetProtocol, NetProtocolHandler, RxQueueEntry};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shared registries of one stack instance. Handlers and drivers receive a
/// reference to this; nothing is process-global, so independent stacks can
/// run side by side (the tests do).
///
/// Lock order: device-list before per-device state, protocol-list before
/// per-protocol queue, never reversed. Queue locks are never held across a
/// driver or handler callback.
pub struct NetCore {
    devices: Mutex<Vec<Arc<NetDevice>>>,
    protocols: Mutex<Vec<NetProtocol>>,
    pub ip: IpContext,
    pub arp: ArpTable,
}

impl NetCore {
    fn new() -> NetCore {
        NetCore {
            devices: Mutex::new(Vec::new()),
            protocols: Mutex::new(Vec::new()),
            ip: IpContext::new(),
            arp: ArpTable::new(),
        }
    }

    /// Opens the driver, installs the hardware address it reports, assigns
    /// the `net<N>` identity, marks the device UP and links it in.
    pub fn device_register(&self, mut dev: NetDevice) -> Result<Arc<NetDevice>, NetError> {
        if let Some(address) = dev.driver().open()? {
            dev.address = address;
        }
        let mut devices = self.devices.lock().unwrap();
        dev.index = devices.len() as u32;
        dev.name = format!("net{}", dev.index);
        dev.set_up();
        info!(
            "<{}> registered, type={:?} mtu={}",
            dev.name, dev.device_type, dev.mtu
        );
        let dev = Arc::new(dev);
        devices.push(Arc::clone(&dev));
        Ok(dev)
    }

    /// Hands one received frame payload to the protocol registered for
    /// `ethertype`. Frames with no registered protocol are dropped.
    pub fn device_received(
        &self,
        dev: &Arc<NetDevice>,
        ethertype: u16,
        data: &[u8],
    ) -> Result<(), NetError> {
        let protocols = self.protocols.lock().unwrap();
        let proto = protocols
            .iter()
            .find(|proto| proto.ethertype == ethertype)
            .ok_or(NetError::UnsupportedEthertype(ethertype))?;
        debug!(
            "<{}> received type=0x{:04x} len={}",
            dev.name,
            ethertype,
            data.len()
        );
        proto.enqueue(RxQueueEntry {
            dev: Arc::clone(dev),
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Synchronous re-dispatch used by the Ethernet decode path once it has
    /// stripped the frame header; same lookup semantics as
    /// `device_received`.
    pub fn device_input(
        &self,
        dev: &Arc<NetDevice>,
        ethertype: u16,
        data: &[u8],
    ) -> Result<(), NetError> {
        self.device_received(dev, ethertype, data)
    }

    /// Binds `handler` to an ethertype. At most one entry per ethertype;
    /// a duplicate fails without modifying the registry.
    pub fn protocol_register(
        &self,
        ethertype: u16,
        handler: NetProtocolHandler,
    ) -> Result<(), NetError> {
        let mut protocols = self.protocols.lock().unwrap();
        if protocols.iter().any(|proto| proto.ethertype == ethertype) {
            return Err(NetError::DuplicateEthertype(ethertype));
        }
        protocols.push(NetProtocol::new(ethertype, handler));
        info!("protocol registered: 0x{:04x}", ethertype);
        Ok(())
    }
}

/// The stack: core registries plus the background worker that moves frames
/// between device queues and protocol handlers.
pub struct NetStack {
    core: Arc<NetCore>,
    interrupt: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl NetStack {
    pub fn new() -> NetStack {
        NetStack {
            core: Arc::new(NetCore::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn core(&self) -> &Arc<NetCore> {
        &self.core
    }

    /// Starts the background worker. Idempotent while running.
    pub fn run(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.interrupt.store(false, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        let interrupt = Arc::clone(&self.interrupt);
        self.worker = Some(thread::spawn(move || worker_loop(&core, &interrupt)));
    }

    /// Stops the worker and closes every device. Entries still sitting in
    /// queues are dropped with the stack.
    pub fn shutdown(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let devices = self.core.devices.lock().unwrap();
        for dev in devices.iter() {
            dev.set_down();
            dev.driver().close();
        }
    }
}

impl Default for NetStack {
    fn default() -> NetStack {
        NetStack::new()
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One pass per iteration: at most one tx entry per device and one rx entry
/// per protocol, so no queue can starve the others. Driver transmit, driver
/// poll and every protocol handler run here and nowhere else, which gives a
/// total order at the handler boundary.
fn worker_loop(core: &NetCore, interrupt: &AtomicBool) {
    debug!("worker running...");
    while !interrupt.load(Ordering::SeqCst) {
        let mut count = 0u32;
        {
            let devices = core.devices.lock().unwrap();
            for dev in devices.iter() {
                if !dev.is_up() {
                    continue;
                }
                if let Some(entry) = dev.dequeue() {
                    if let Err(err) =
                        dev.driver()
                            .transmit(dev, entry.ethertype, &entry.data, &entry.dst)
                    {
                        warn!("<{}> transmit failure: {}", dev.name, err);
                    }
                    count += 1;
                }
                if dev.driver().poll(core, dev) {
                    count += 1;
                }
            }
        }
        {
            let protocols = core.protocols.lock().unwrap();
            for proto in protocols.iter() {
                if let Some(entry) = proto.dequeue() {
                    proto.handle(core, entry);
                    count += 1;
                }
            }
        }
        if count == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    debug!("worker shutdown");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::ethernet::ETHERTYPE_IP;
    use crate::devices::{loopback, null};
    use crate::protocols::ip::{self, icmp, IpAddr, IpIface};
    use std::time::Instant;

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_protocol_register_rejects_duplicate() {
        let stack = NetStack::new();
        let core = stack.core();
        core.protocol_register(ETHERTYPE_IP, Box::new(|_, _, _| {}))
            .unwrap();
        assert!(matches!(
            core.protocol_register(ETHERTYPE_IP, Box::new(|_, _, _| {})),
            Err(NetError::DuplicateEthertype(ETHERTYPE_IP))
        ));
    }

    #[test]
    fn test_received_unknown_ethertype_is_dropped() {
        let stack = NetStack::new();
        let core = stack.core();
        let dev = core.device_register(null::setup()).unwrap();
        assert!(matches!(
            core.device_received(&dev, 0x86dd, &[0; 40]),
            Err(NetError::UnsupportedEthertype(0x86dd))
        ));
    }

    #[test]
    fn test_device_names_are_sequential() {
        let stack = NetStack::new();
        let core = stack.core();
        let first = core.device_register(null::setup()).unwrap();
        let second = core.device_register(loopback::setup()).unwrap();
        assert_eq!(first.name, "net0");
        assert_eq!(second.name, "net1");
        assert!(first.is_up());
        assert!(second.is_up());
    }

    #[test]
    fn test_worker_dispatches_in_enqueue_order() {
        let mut stack = NetStack::new();
        let core = Arc::clone(stack.core());
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.protocol_register(
            ETHERTYPE_IP,
            Box::new(move |_, _, data| sink.lock().unwrap().push(data[0])),
        )
        .unwrap();

        let dev = core.device_register(null::setup()).unwrap();
        core.device_received(&dev, ETHERTYPE_IP, &[1]).unwrap();
        core.device_received(&dev, ETHERTYPE_IP, &[2]).unwrap();
        core.device_received(&dev, ETHERTYPE_IP, &[3]).unwrap();

        stack.run();
        assert!(wait_until(|| seen.lock().unwrap().len() == 3));
        stack.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_loopback_round_trip_through_worker() {
        let mut stack = NetStack::new();
        let core = Arc::clone(stack.core());
        ip::init(&core).unwrap();

        let received: Arc<Mutex<Vec<(Vec<u8>, IpAddr, IpAddr)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        core.ip
            .protocol_register(
                "test",
                17,
                Box::new(move |_, data, src, dst| {
                    sink.lock().unwrap().push((data.to_vec(), src, dst))
                }),
            )
            .unwrap();

        let dev = core.device_register(loopback::setup()).unwrap();
        let iface = core
            .ip
            .iface_register(IpIface::alloc(&dev, "127.0.0.1", "255.0.0.0").unwrap())
            .unwrap();

        stack.run();
        let dst: IpAddr = "127.0.0.1".parse().unwrap();
        let sent = ip::output(&core, 17, b"knock knock", IpAddr::ANY, dst).unwrap();
        assert_eq!(sent, 11);

        assert!(wait_until(|| !received.lock().unwrap().is_empty()));
        stack.shutdown();

        let received = received.lock().unwrap();
        let (payload, src, seen_dst) = &received[0];
        assert_eq!(payload, b"knock knock");
        assert_eq!(*src, iface.unicast);
        assert_eq!(*seen_dst, dst);
    }

    #[test]
    fn test_icmp_echo_over_loopback() {
        let mut stack = NetStack::new();
        let core = Arc::clone(stack.core());
        ip::init(&core).unwrap();

        // the echo responder, wrapped so the message types crossing the
        // handler boundary stay observable
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.ip
            .protocol_register(
                "icmp",
                1,
                Box::new(move |core, data, src, dst| {
                    sink.lock().unwrap().push(data[0]);
                    icmp::input(core, data, src, dst);
                }),
            )
            .unwrap();

        let dev = core.device_register(loopback::setup()).unwrap();
        core.ip
            .iface_register(IpIface::alloc(&dev, "127.0.0.1", "255.0.0.0").unwrap())
            .unwrap();

        stack.run();
        let dst: IpAddr = "127.0.0.1".parse().unwrap();
        icmp::output(
            &core,
            icmp::ICMP_TYPE_ECHO,
            0,
            0x0001_0001u32.to_be(),
            b"ping",
            IpAddr::ANY,
            dst,
        )
        .unwrap();

        // The request loops back, the responder answers, and the reply
        // loops back in turn; both traverse the same device queue.
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        stack.shutdown();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![icmp::ICMP_TYPE_ECHO, icmp::ICMP_TYPE_ECHO_REPLY]
        );
        assert!(dev.dequeue().is_none());
    }
}
