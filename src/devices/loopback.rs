use super::{
    NetDevice, NetDeviceType, NetDriver, NET_DEVICE_ADDR_LEN, NET_DEVICE_FLAG_LOOPBACK,
    NET_DEVICE_FLAG_NOARP,
};
use crate::error::NetError;
use crate::net::NetCore;
use log::trace;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const LOOPBACK_MTU: usize = u16::MAX as usize;

/// Frames transmitted here come straight back up on the next poll.
#[derive(Default)]
pub struct LoopbackDriver {
    queue: Mutex<VecDeque<(u16, Vec<u8>)>>,
}

impl NetDriver for LoopbackDriver {
    fn transmit(
        &self,
        dev: &NetDevice,
        ethertype: u16,
        data: &[u8],
        _dst: &[u8],
    ) -> Result<(), NetError> {
        trace!(
            "<{}> loop {} bytes, type=0x{:04x}",
            dev.name,
            data.len(),
            ethertype
        );
        self.queue
            .lock()
            .unwrap()
            .push_back((ethertype, data.to_vec()));
        Ok(())
    }

    fn poll(&self, core: &NetCore, dev: &Arc<NetDevice>) -> bool {
        let entry = self.queue.lock().unwrap().pop_front();
        match entry {
            Some((ethertype, data)) => core.device_received(dev, ethertype, &data).is_ok(),
            None => false,
        }
    }
}

pub fn setup() -> NetDevice {
    NetDevice::new(
        NetDeviceType::Loopback,
        LOOPBACK_MTU,
        NET_DEVICE_FLAG_LOOPBACK | NET_DEVICE_FLAG_NOARP,
        0,
        0,
        [0; NET_DEVICE_ADDR_LEN],
        Box::new(LoopbackDriver::default()),
    )
}
