use super::{
    NetDevice, NetDeviceType, NetDriver, NET_DEVICE_ADDR_LEN, NET_DEVICE_FLAG_BROADCAST,
};
use crate::error::NetError;
use crate::net::NetCore;
use crate::utils::byte::{hton16, ntoh16};
use log::{debug, trace, warn};
use std::sync::Arc;

pub const ETH_ADDR_LEN: usize = 6;
pub const ETH_HDR_SIZE: usize = 14;
pub const ETH_FRAME_MIN: usize = 60; // without FCS
pub const ETH_FRAME_MAX: usize = 1514; // without FCS
pub const ETH_PAYLOAD_MIN: usize = ETH_FRAME_MIN - ETH_HDR_SIZE;
pub const ETH_PAYLOAD_MAX: usize = ETH_FRAME_MAX - ETH_HDR_SIZE;

pub const ETH_ADDR_ANY: [u8; ETH_ADDR_LEN] = [0x00; ETH_ADDR_LEN];
pub const ETH_ADDR_BROADCAST: [u8; ETH_ADDR_LEN] = [0xff; ETH_ADDR_LEN];

pub const ETHERTYPE_IP: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

const RX_BUF_SIZE: usize = 2048;

/// Ethernet II header (unit: octet)
/// [ Dst MAC: 6 | Src MAC: 6 | EtherType: 2 | Payload: 46 to 1500 | FCS: 4 ]
/// The FCS is supplied by the hardware or the kernel and never seen here.
#[repr(C, packed)]
pub struct EthernetHeader {
    pub dst: [u8; ETH_ADDR_LEN],
    pub src: [u8; ETH_ADDR_LEN],
    pub eth_type: u16, // big-endian on the wire
}

impl EthernetHeader {
    pub fn to_bytes(&self) -> [u8; ETH_HDR_SIZE] {
        // SAFETY: repr(C, packed) with no padding, exactly ETH_HDR_SIZE bytes
        unsafe { std::mem::transmute_copy(self) }
    }

    pub fn from_bytes(data: &[u8]) -> Option<EthernetHeader> {
        if data.len() < ETH_HDR_SIZE {
            return None;
        }
        // SAFETY: length checked above; the packed layout has no alignment
        // requirement beyond one byte
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const EthernetHeader) })
    }
}

pub fn ethertype_ntoa(ethertype: u16) -> &'static str {
    match ethertype {
        ETHERTYPE_IP => "IP",
        ETHERTYPE_ARP => "ARP",
        ETHERTYPE_IPV6 => "IPv6",
        _ => "UNKNOWN",
    }
}

/// Parses `xx:xx:xx:xx:xx:xx`; anything past the sixth octet is rejected.
pub fn mac_addr_pton(p: &str) -> Result<[u8; ETH_ADDR_LEN], NetError> {
    let mut addr = [0; ETH_ADDR_LEN];
    let mut parts = p.split(':');
    for octet in addr.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| NetError::AddrParse(p.to_string()))?;
        if part.is_empty() || part.len() > 2 || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(NetError::AddrParse(p.to_string()));
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| NetError::AddrParse(p.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(NetError::AddrParse(p.to_string()));
    }
    Ok(addr)
}

pub fn mac_addr_ntop(addr: &[u8]) -> String {
    addr.iter()
        .take(ETH_ADDR_LEN)
        .map(|octet| format!("{:02x}", octet))
        .collect::<Vec<_>>()
        .join(":")
}

/// Builds one frame around `data` and writes it through `write`: header,
/// payload, zero padding up to the minimum payload size. Succeeds only when
/// the driver reports exactly the frame length written.
pub fn transmit_helper<W>(
    dev: &NetDevice,
    ethertype: u16,
    data: &[u8],
    dst: &[u8],
    write: W,
) -> Result<(), NetError>
where
    W: FnOnce(&[u8]) -> std::io::Result<usize>,
{
    if data.len() > ETH_PAYLOAD_MAX {
        return Err(NetError::TooLong {
            len: data.len(),
            limit: ETH_PAYLOAD_MAX,
        });
    }
    if dst.len() < ETH_ADDR_LEN {
        return Err(NetError::Invalid("ethernet destination address"));
    }
    let mut hdr = EthernetHeader {
        dst: [0; ETH_ADDR_LEN],
        src: [0; ETH_ADDR_LEN],
        eth_type: hton16(ethertype),
    };
    hdr.dst.copy_from_slice(&dst[..ETH_ADDR_LEN]);
    hdr.src.copy_from_slice(&dev.address[..ETH_ADDR_LEN]);

    let mut frame = [0u8; ETH_FRAME_MAX];
    frame[..ETH_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
    frame[ETH_HDR_SIZE..ETH_HDR_SIZE + data.len()].copy_from_slice(data);
    let flen = ETH_HDR_SIZE + data.len().max(ETH_PAYLOAD_MIN);

    trace!(
        "<{}> transmit {} bytes to {}, type=0x{:04x} ({})",
        dev.name,
        flen,
        mac_addr_ntop(&hdr.dst),
        ethertype,
        ethertype_ntoa(ethertype)
    );
    let written = write(&frame[..flen])?;
    if written != flen {
        return Err(NetError::Device(format!(
            "<{}> short write: {} of {} bytes",
            dev.name, written, flen
        )));
    }
    Ok(())
}

/// Pulls one frame through `read` and, when it is addressed to `dev` or to
/// the broadcast address, re-dispatches the inner payload into the protocol
/// registry. Returns true when a frame was delivered upward.
///
/// The padded link-layer length is passed through untrimmed; IP recovers
/// the real datagram length from the header total-length field.
pub fn poll_helper<R>(core: &NetCore, dev: &Arc<NetDevice>, read: R) -> bool
where
    R: FnOnce(&mut [u8]) -> std::io::Result<usize>,
{
    let mut frame = [0u8; RX_BUF_SIZE];
    let flen = match read(&mut frame) {
        Ok(n) => n,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return false,
        Err(err) => {
            warn!("<{}> read failure: {}", dev.name, err);
            return false;
        }
    };
    if flen < ETH_HDR_SIZE {
        return false;
    }
    let hdr = match EthernetHeader::from_bytes(&frame[..flen]) {
        Some(hdr) => hdr,
        None => return false,
    };
    if hdr.dst[..] != dev.address[..ETH_ADDR_LEN] && hdr.dst != ETH_ADDR_BROADCAST {
        // for another host
        return false;
    }
    let ethertype = ntoh16(hdr.eth_type);
    trace!(
        "<{}> input {} bytes from {}, type=0x{:04x} ({})",
        dev.name,
        flen,
        mac_addr_ntop(&hdr.src),
        ethertype,
        ethertype_ntoa(ethertype)
    );
    if let Err(err) = core.device_input(dev, ethertype, &frame[ETH_HDR_SIZE..flen]) {
        debug!("<{}> dropped: {}", dev.name, err);
        return false;
    }
    true
}

/// Ethernet device scaffold: Ethernet II link attributes, broadcast set to
/// ff:ff:ff:ff:ff:ff. The hardware address is installed by the driver when
/// the device is opened.
pub fn setup(driver: Box<dyn NetDriver>) -> NetDevice {
    let mut broadcast = [0; NET_DEVICE_ADDR_LEN];
    broadcast[..ETH_ADDR_LEN].copy_from_slice(&ETH_ADDR_BROADCAST);
    NetDevice::new(
        NetDeviceType::Ethernet,
        ETH_PAYLOAD_MAX,
        NET_DEVICE_FLAG_BROADCAST,
        ETH_HDR_SIZE as u16,
        ETH_ADDR_LEN as u16,
        broadcast,
        driver,
    )
}
