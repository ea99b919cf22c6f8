pub mod arp;
pub mod ip;

use crate::devices::NetDevice;
use crate::net::NetCore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Handler invoked on the worker thread for each frame of the registered
/// ethertype. All handlers run strictly serialized on that one thread, so
/// they may keep non-reentrant state without extra locking.
pub type NetProtocolHandler = Box<dyn Fn(&NetCore, &Arc<NetDevice>, &[u8]) + Send + Sync>;

/// Inbound entry. Owned by the protocol queue until the worker pops it.
pub struct RxQueueEntry {
    pub dev: Arc<NetDevice>,
    pub data: Vec<u8>,
}

/// One ethertype binding: the receive queue and the handler draining it.
pub struct NetProtocol {
    pub ethertype: u16,
    rxq: Mutex<VecDeque<RxQueueEntry>>,
    handler: NetProtocolHandler,
}

impl NetProtocol {
    pub fn new(ethertype: u16, handler: NetProtocolHandler) -> NetProtocol {
        NetProtocol {
            ethertype,
            rxq: Mutex::new(VecDeque::new()),
            handler,
        }
    }

    pub(crate) fn enqueue(&self, entry: RxQueueEntry) {
        self.rxq.lock().unwrap().push_back(entry);
    }

    /// Pops one pending inbound entry. The lock is released before the
    /// handler runs.
    pub(crate) fn dequeue(&self) -> Option<RxQueueEntry> {
        self.rxq.lock().unwrap().pop_front()
    }

    pub(crate) fn handle(&self, core: &NetCore, entry: RxQueueEntry) {
        (self.handler)(core, &entry.dev, &entry.data);
    }
}
