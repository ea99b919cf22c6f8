use super::{IpAddr, IP_PROTOCOL_ICMP};
use crate::error::NetError;
use crate::net::NetCore;
use crate::utils::byte::ntoh32;
use crate::utils::cksum16;
use log::{debug, info, warn};

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACH: u8 = 3;
pub const ICMP_TYPE_ECHO: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;

pub const ICMP_HDR_SIZE: usize = 8;

/// ICMP header (unit: octet)
/// [ type: 1 | code: 1 | sum: 2 | values: 4 ]
/// `values` carries identifier and sequence number for echo messages and is
/// kept in network order throughout.
#[repr(C, packed)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub sum: u16,
    pub values: u32,
}

impl IcmpHeader {
    pub fn to_bytes(&self) -> [u8; ICMP_HDR_SIZE] {
        // SAFETY: repr(C, packed) with no padding, exactly ICMP_HDR_SIZE bytes
        unsafe { std::mem::transmute_copy(self) }
    }

    pub fn from_bytes(data: &[u8]) -> Option<IcmpHeader> {
        if data.len() < ICMP_HDR_SIZE {
            return None;
        }
        // SAFETY: length checked above; the packed layout has no alignment
        // requirement beyond one byte
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const IcmpHeader) })
    }
}

/// Echo responder. The checksum covers the whole message, header plus
/// payload.
pub(crate) fn input(core: &NetCore, data: &[u8], src: IpAddr, dst: IpAddr) {
    let Some(hdr) = IcmpHeader::from_bytes(data) else {
        warn!("icmp message too small: {} bytes", data.len());
        return;
    };
    if cksum16(data, 0) != 0 {
        warn!("icmp checksum error");
        return;
    }
    let values = ntoh32(hdr.values);
    match hdr.icmp_type {
        ICMP_TYPE_ECHO => {
            debug!(
                "echo request from {}, id={} seq={}",
                src,
                values >> 16,
                values & 0xffff
            );
            // Reply from the address the request was sent to; after a
            // limited broadcast the route decides the source instead.
            let reply_src = if dst == IpAddr::BROADCAST {
                IpAddr::ANY
            } else {
                dst
            };
            if let Err(err) = output(
                core,
                ICMP_TYPE_ECHO_REPLY,
                hdr.code,
                hdr.values,
                &data[ICMP_HDR_SIZE..],
                reply_src,
                src,
            ) {
                warn!("echo reply failure: {}", err);
            }
        }
        ICMP_TYPE_ECHO_REPLY => {
            info!(
                "echo reply from {}, id={} seq={}",
                src,
                values >> 16,
                values & 0xffff
            );
        }
        other => debug!("icmp type {} ignored", other),
    }
}

/// Builds one ICMP message and sends it through the IP layer. `values` is
/// carried verbatim, network order.
pub fn output(
    core: &NetCore,
    icmp_type: u8,
    code: u8,
    values: u32,
    data: &[u8],
    src: IpAddr,
    dst: IpAddr,
) -> Result<usize, NetError> {
    let hdr = IcmpHeader {
        icmp_type,
        code,
        sum: 0,
        values,
    };
    let mut message = Vec::with_capacity(ICMP_HDR_SIZE + data.len());
    message.extend_from_slice(&hdr.to_bytes());
    message.extend_from_slice(data);
    let sum = cksum16(&message, 0);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    debug!("{} bytes to {}", message.len(), dst);
    super::output(core, IP_PROTOCOL_ICMP, &message, src, dst)
}

/// Registers the responder as IP protocol 1.
pub fn init(core: &NetCore) -> Result<(), NetError> {
    core.ip
        .protocol_register("icmp", IP_PROTOCOL_ICMP, Box::new(input))
}
