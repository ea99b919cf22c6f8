use super::{
    NetDevice, NetDeviceType, NetDriver, NET_DEVICE_ADDR_LEN, NET_DEVICE_FLAG_NOARP,
};
use crate::error::NetError;
use log::trace;

const NULL_MTU: usize = u16::MAX as usize;

/// Discards everything it is asked to transmit.
pub struct NullDriver;

impl NetDriver for NullDriver {
    fn transmit(
        &self,
        dev: &NetDevice,
        ethertype: u16,
        data: &[u8],
        _dst: &[u8],
    ) -> Result<(), NetError> {
        trace!(
            "<{}> discard {} bytes, type=0x{:04x}",
            dev.name,
            data.len(),
            ethertype
        );
        Ok(())
    }
}

pub fn setup() -> NetDevice {
    NetDevice::new(
        NetDeviceType::Null,
        NULL_MTU,
        NET_DEVICE_FLAG_NOARP,
        0,
        0,
        [0; NET_DEVICE_ADDR_LEN],
        Box::new(NullDriver),
    )
}
