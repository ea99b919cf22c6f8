pub mod ethernet;
pub mod loopback;
pub mod null;

use crate::error::NetError;
use crate::net::NetCore;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const NET_DEVICE_ADDR_LEN: usize = 14;

pub const NET_DEVICE_FLAG_UP: u16 = 0x0001;
pub const NET_DEVICE_FLAG_LOOPBACK: u16 = 0x0010;
pub const NET_DEVICE_FLAG_BROADCAST: u16 = 0x0020;
pub const NET_DEVICE_FLAG_NOARP: u16 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetDeviceType {
    Null,
    Loopback,
    Ethernet,
}

/// Outbound entry. Owned by the device queue until the worker pops it and
/// hands the payload to the driver.
pub struct TxQueueEntry {
    pub dst: [u8; NET_DEVICE_ADDR_LEN],
    pub ethertype: u16,
    pub data: Vec<u8>,
}

struct NetDeviceState {
    flags: u16,
    txq: VecDeque<TxQueueEntry>,
}

/// Driver capability surface of a device backend. Implementations keep fd
/// or queue state behind interior mutability; the worker thread is the only
/// caller of `transmit` and `poll`.
pub trait NetDriver: Send + Sync {
    /// Brings the backend up. Returns the hardware address when the backend
    /// has one; it is installed on the device before the device is shared.
    fn open(&self) -> Result<Option<[u8; NET_DEVICE_ADDR_LEN]>, NetError> {
        Ok(None)
    }

    fn close(&self) {}

    /// Puts one frame payload on the wire. Runs on the worker thread with
    /// no stack lock held.
    fn transmit(
        &self,
        dev: &NetDevice,
        ethertype: u16,
        data: &[u8],
        dst: &[u8],
    ) -> Result<(), NetError>;

    /// Checks the backend for received frames and injects them through
    /// `NetCore::device_input`. Returns true when a frame was handled.
    fn poll(&self, _core: &NetCore, _dev: &Arc<NetDevice>) -> bool {
        false
    }
}

pub struct NetDevice {
    pub index: u32,
    pub name: String,
    pub device_type: NetDeviceType,
    pub mtu: usize,
    pub header_len: u16,
    pub address_len: u16,
    /// Hardware address; immutable once the device is registered.
    pub address: [u8; NET_DEVICE_ADDR_LEN],
    pub broadcast: [u8; NET_DEVICE_ADDR_LEN],
    state: Mutex<NetDeviceState>,
    driver: Box<dyn NetDriver>,
}

impl NetDevice {
    pub fn new(
        device_type: NetDeviceType,
        mtu: usize,
        flags: u16,
        header_len: u16,
        address_len: u16,
        broadcast: [u8; NET_DEVICE_ADDR_LEN],
        driver: Box<dyn NetDriver>,
    ) -> NetDevice {
        NetDevice {
            index: 0,
            name: String::new(),
            device_type,
            mtu,
            header_len,
            address_len,
            address: [0; NET_DEVICE_ADDR_LEN],
            broadcast,
            state: Mutex::new(NetDeviceState {
                flags,
                txq: VecDeque::new(),
            }),
            driver,
        }
    }

    pub fn is_up(&self) -> bool {
        self.flags() & NET_DEVICE_FLAG_UP != 0
    }

    pub fn flags(&self) -> u16 {
        self.state.lock().unwrap().flags
    }

    pub(crate) fn set_up(&self) {
        self.state.lock().unwrap().flags |= NET_DEVICE_FLAG_UP;
    }

    pub(crate) fn set_down(&self) {
        self.state.lock().unwrap().flags &= !NET_DEVICE_FLAG_UP;
    }

    /// Queues one outbound frame payload for the worker. Returns without
    /// touching driver I/O.
    pub fn transmit(&self, ethertype: u16, data: &[u8], dst: &[u8]) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        if state.flags & NET_DEVICE_FLAG_UP == 0 {
            return Err(NetError::DeviceDown(self.name.clone()));
        }
        let mut entry = TxQueueEntry {
            dst: [0; NET_DEVICE_ADDR_LEN],
            ethertype,
            data: data.to_vec(),
        };
        let n = dst.len().min(NET_DEVICE_ADDR_LEN);
        entry.dst[..n].copy_from_slice(&dst[..n]);
        state.txq.push_back(entry);
        debug!(
            "<{}> queued type=0x{:04x} len={}",
            self.name,
            ethertype,
            data.len()
        );
        Ok(())
    }

    /// Pops one pending outbound entry. The lock is released before any
    /// driver callback runs.
    pub fn dequeue(&self) -> Option<TxQueueEntry> {
        self.state.lock().unwrap().txq.pop_front()
    }

    pub fn driver(&self) -> &dyn NetDriver {
        self.driver.as_ref()
    }
}
