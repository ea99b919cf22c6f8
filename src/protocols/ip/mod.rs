pub mod icmp;

use crate::devices::ethernet::ETHERTYPE_IP;
use crate::devices::{NetDevice, NET_DEVICE_ADDR_LEN, NET_DEVICE_FLAG_NOARP};
use crate::error::NetError;
use crate::net::NetCore;
use crate::protocols::arp::{self, ArpResult};
use crate::utils::byte::{hton16, hton32, ntoh16, ntoh32};
use crate::utils::cksum16;
use log::{debug, info, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const IP_VERSION_IPV4: u8 = 4;
pub const IP_HDR_SIZE_MIN: usize = 20;
pub const IP_ADDR_LEN: usize = 4;

const IP_TTL_DEFAULT: u8 = 0xff;

const IP_HDR_FLAG_MF: u16 = 0x2000;
const IP_HDR_OFFSET_MASK: u16 = 0x1fff;

// IANA assigned internet protocol numbers
pub const IP_PROTOCOL_ICMP: u8 = 1;
pub const IP_PROTOCOL_TCP: u8 = 6;
pub const IP_PROTOCOL_UDP: u8 = 17;

/// IPv4 address in host byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IpAddr(u32);

impl IpAddr {
    pub const ANY: IpAddr = IpAddr(0x00000000);
    pub const BROADCAST: IpAddr = IpAddr(0xffffffff);

    pub fn from_bytes(bytes: [u8; IP_ADDR_LEN]) -> IpAddr {
        IpAddr(u32::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; IP_ADDR_LEN] {
        self.0.to_be_bytes()
    }
}

impl FromStr for IpAddr {
    type Err = NetError;

    /// Strict dotted-quad: exactly four decimal octets, nothing else.
    fn from_str(s: &str) -> Result<IpAddr, NetError> {
        let mut bytes = [0u8; IP_ADDR_LEN];
        let mut parts = s.split('.');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetError::AddrParse(s.to_string()))?;
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|c| c.is_ascii_digit()) {
                return Err(NetError::AddrParse(s.to_string()));
            }
            *byte = part.parse().map_err(|_| NetError::AddrParse(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetError::AddrParse(s.to_string()));
        }
        Ok(IpAddr::from_bytes(bytes))
    }
}

impl fmt::Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(f, "{}.{}.{}.{}", b[0], b[1], b[2], b[3])
    }
}

impl fmt::Debug for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::ops::BitAnd for IpAddr {
    type Output = IpAddr;
    fn bitand(self, rhs: IpAddr) -> IpAddr {
        IpAddr(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for IpAddr {
    type Output = IpAddr;
    fn bitor(self, rhs: IpAddr) -> IpAddr {
        IpAddr(self.0 | rhs.0)
    }
}

impl std::ops::Not for IpAddr {
    type Output = IpAddr;
    fn not(self) -> IpAddr {
        IpAddr(!self.0)
    }
}

/// IPv4 header without options (unit: octet)
/// [ vhl: 1 | tos: 1 | total: 2 | id: 2 | offset: 2 | ttl: 1 | protocol: 1 | sum: 2 | src: 4 | dst: 4 ]
/// Multi-byte fields are big-endian on the wire.
#[repr(C, packed)]
pub struct IpHeader {
    pub vhl: u8,
    pub tos: u8,
    pub total: u16,
    pub id: u16,
    pub offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub sum: u16,
    pub src: u32,
    pub dst: u32,
}

impl IpHeader {
    fn new(protocol: u8, total: u16, id: u16, offset: u16, src: IpAddr, dst: IpAddr) -> IpHeader {
        IpHeader {
            vhl: (IP_VERSION_IPV4 << 4) | (IP_HDR_SIZE_MIN >> 2) as u8,
            tos: 0,
            total: hton16(total),
            id: hton16(id),
            offset: hton16(offset),
            ttl: IP_TTL_DEFAULT,
            protocol,
            sum: 0,
            src: hton32(src.0),
            dst: hton32(dst.0),
        }
    }

    pub fn to_bytes(&self) -> [u8; IP_HDR_SIZE_MIN] {
        // SAFETY: repr(C, packed) with no padding, exactly IP_HDR_SIZE_MIN bytes
        unsafe { std::mem::transmute_copy(self) }
    }

    pub fn from_bytes(data: &[u8]) -> Option<IpHeader> {
        if data.len() < IP_HDR_SIZE_MIN {
            return None;
        }
        // SAFETY: length checked above; the packed layout has no alignment
        // requirement beyond one byte
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const IpHeader) })
    }

    pub fn version(&self) -> u8 {
        self.vhl >> 4
    }

    pub fn hdr_len(&self) -> usize {
        ((self.vhl & 0x0f) as usize) << 2
    }

    pub fn total_len(&self) -> usize {
        ntoh16(self.total) as usize
    }

    pub fn src_addr(&self) -> IpAddr {
        IpAddr(ntoh32(self.src))
    }

    pub fn dst_addr(&self) -> IpAddr {
        IpAddr(ntoh32(self.dst))
    }

    fn with_checksum(mut self) -> IpHeader {
        self.sum = 0;
        self.sum = hton16(cksum16(&self.to_bytes(), 0));
        self
    }
}

/// IPv4 binding of a device. The (unicast, netmask, broadcast) triple is
/// fixed at allocation and broadcast is derived, never stored from outside.
pub struct IpIface {
    pub unicast: IpAddr,
    pub netmask: IpAddr,
    pub broadcast: IpAddr,
    dev: Arc<NetDevice>,
}

impl IpIface {
    pub fn alloc(dev: &Arc<NetDevice>, unicast: &str, netmask: &str) -> Result<IpIface, NetError> {
        let unicast: IpAddr = unicast.parse()?;
        let netmask: IpAddr = netmask.parse()?;
        Ok(IpIface {
            unicast,
            netmask,
            broadcast: (unicast & netmask) | !netmask,
            dev: Arc::clone(dev),
        })
    }

    pub fn device(&self) -> &Arc<NetDevice> {
        &self.dev
    }
}

#[derive(Clone)]
pub struct IpRoute {
    pub network: IpAddr,
    pub netmask: IpAddr,
    pub nexthop: IpAddr,
    pub iface: Arc<IpIface>,
}

pub struct IpRoutes {
    entries: Mutex<Vec<IpRoute>>,
}

impl IpRoutes {
    fn new() -> IpRoutes {
        IpRoutes {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// A `nexthop` of `IpAddr::ANY` means directly connected. The network
    /// must not have host bits set.
    pub fn add(
        &self,
        network: IpAddr,
        netmask: IpAddr,
        nexthop: IpAddr,
        iface: &Arc<IpIface>,
    ) -> Result<(), NetError> {
        if network & netmask != network {
            return Err(NetError::Invalid("route network has host bits set"));
        }
        info!(
            "route added: {}/{} via {} dev <{}>",
            network,
            netmask,
            nexthop,
            iface.device().name
        );
        self.entries.lock().unwrap().push(IpRoute {
            network,
            netmask,
            nexthop,
            iface: Arc::clone(iface),
        });
        Ok(())
    }

    /// Removes every route bound to `iface`.
    pub fn del(&self, iface: &Arc<IpIface>) {
        self.entries
            .lock()
            .unwrap()
            .retain(|route| !Arc::ptr_eq(&route.iface, iface));
    }

    /// Longest-prefix match. The default route (network and netmask both
    /// zero) matches everything and loses to any longer mask; equal-mask
    /// ties keep the earliest entry, though callers should not rely on it.
    pub fn lookup(&self, dst: IpAddr) -> Option<IpRoute> {
        let entries = self.entries.lock().unwrap();
        let mut candidate: Option<&IpRoute> = None;
        for route in entries.iter() {
            if dst & route.netmask == route.network {
                match candidate {
                    Some(best) if best.netmask.0 >= route.netmask.0 => {}
                    _ => candidate = Some(route),
                }
            }
        }
        candidate.cloned()
    }
}

/// Handler for one upper protocol, invoked on the worker thread with the
/// datagram payload and the addresses from the header.
pub type IpProtocolHandler = Box<dyn Fn(&NetCore, &[u8], IpAddr, IpAddr) + Send + Sync>;

struct IpProtocol {
    name: String,
    protocol: u8,
    handler: IpProtocolHandler,
}

/// Monotonic datagram identification, wrapping at 2^16. Seeded at 128.
pub struct IpIdGenerator {
    id: Mutex<u16>,
}

impl IpIdGenerator {
    fn new() -> IpIdGenerator {
        IpIdGenerator { id: Mutex::new(128) }
    }

    pub fn generate(&self) -> u16 {
        let mut id = self.id.lock().unwrap();
        let ret = *id;
        *id = id.wrapping_add(1);
        ret
    }
}

/// The IPv4 side of a stack: interfaces, routes, upper protocols and the
/// identification counter.
pub struct IpContext {
    ifaces: Mutex<Vec<Arc<IpIface>>>,
    pub routes: IpRoutes,
    protocols: Mutex<Vec<IpProtocol>>,
    pub id_generator: IpIdGenerator,
}

impl IpContext {
    pub(crate) fn new() -> IpContext {
        IpContext {
            ifaces: Mutex::new(Vec::new()),
            routes: IpRoutes::new(),
            protocols: Mutex::new(Vec::new()),
            id_generator: IpIdGenerator::new(),
        }
    }

    /// Adds the directly-connected route and links the interface into the
    /// global list.
    pub fn iface_register(&self, iface: IpIface) -> Result<Arc<IpIface>, NetError> {
        let iface = Arc::new(iface);
        self.routes.add(
            iface.unicast & iface.netmask,
            iface.netmask,
            IpAddr::ANY,
            &iface,
        )?;
        info!(
            "<{}> iface registered: {} netmask {} broadcast {}",
            iface.device().name,
            iface.unicast,
            iface.netmask,
            iface.broadcast
        );
        self.ifaces.lock().unwrap().push(Arc::clone(&iface));
        Ok(iface)
    }

    pub fn iface_by_addr(&self, addr: IpAddr) -> Option<Arc<IpIface>> {
        self.ifaces
            .lock()
            .unwrap()
            .iter()
            .find(|iface| iface.unicast == addr)
            .cloned()
    }

    /// Interface whose route would carry traffic toward `peer`, so replies
    /// originate from the right address.
    pub fn iface_by_peer(&self, peer: IpAddr) -> Option<Arc<IpIface>> {
        self.routes.lookup(peer).map(|route| route.iface)
    }

    /// IPv4 interface attached to `dev`, if any.
    pub fn iface_on_device(&self, dev: &NetDevice) -> Option<Arc<IpIface>> {
        self.ifaces
            .lock()
            .unwrap()
            .iter()
            .find(|iface| iface.device().index == dev.index)
            .cloned()
    }

    /// Installs `(0, 0, gateway, iface)`; the longest-prefix match makes it
    /// the fallback for everything without a more specific route.
    pub fn set_default_gateway(&self, iface: &Arc<IpIface>, gateway: &str) -> Result<(), NetError> {
        let gw: IpAddr = gateway.parse()?;
        self.routes.add(IpAddr::ANY, IpAddr::ANY, gw, iface)
    }

    /// Binds a handler to an upper-protocol number. At most one entry per
    /// number; a duplicate fails without modifying the registry.
    pub fn protocol_register(
        &self,
        name: &str,
        protocol: u8,
        handler: IpProtocolHandler,
    ) -> Result<(), NetError> {
        let mut protocols = self.protocols.lock().unwrap();
        if protocols.iter().any(|proto| proto.protocol == protocol) {
            return Err(NetError::DuplicateIpProtocol(protocol));
        }
        protocols.push(IpProtocol {
            name: name.to_string(),
            protocol,
            handler,
        });
        info!("ip protocol registered: {} ({})", name, protocol);
        Ok(())
    }
}

/// Validates one datagram and dispatches its payload to the registered
/// upper protocol. Anything that fails validation is dropped here.
pub fn input(core: &NetCore, dev: &Arc<NetDevice>, data: &[u8]) {
    let Some(hdr) = IpHeader::from_bytes(data) else {
        warn!("<{}> ip packet too small: {} bytes", dev.name, data.len());
        return;
    };
    if hdr.version() != IP_VERSION_IPV4 {
        warn!("<{}> ip version error: {}", dev.name, hdr.version());
        return;
    }
    let hlen = hdr.hdr_len();
    let total = hdr.total_len();
    if hlen < IP_HDR_SIZE_MIN || total < hlen || data.len() < total {
        warn!(
            "<{}> ip length error: len={} hlen={} total={}",
            dev.name,
            data.len(),
            hlen,
            total
        );
        return;
    }
    if hdr.ttl == 0 {
        warn!("<{}> ip packet was dead (TTL=0)", dev.name);
        return;
    }
    if cksum16(&data[..hlen], 0) != 0 {
        warn!("<{}> ip checksum error", dev.name);
        return;
    }
    let offset = ntoh16(hdr.offset);
    if offset & (IP_HDR_FLAG_MF | IP_HDR_OFFSET_MASK) != 0 {
        warn!("<{}> fragments are not supported", dev.name);
        return;
    }
    let Some(iface) = core.ip.iface_on_device(dev) else {
        warn!("<{}> no ip interface", dev.name);
        return;
    };
    let dst = hdr.dst_addr();
    if dst != iface.unicast && dst != iface.broadcast && dst != IpAddr::BROADCAST {
        // for another host
        return;
    }
    let src = hdr.src_addr();
    debug!(
        "<{}> {} bytes from {} to {}, protocol={}",
        dev.name, total, src, dst, hdr.protocol
    );
    let protocols = core.ip.protocols.lock().unwrap();
    match protocols.iter().find(|proto| proto.protocol == hdr.protocol) {
        Some(proto) => {
            debug!("dispatch to {}", proto.name);
            (proto.handler)(core, &data[hlen..total], src, dst)
        }
        None => debug!("<{}> unsupported ip protocol: {}", dev.name, hdr.protocol),
    }
}

/// Sends one datagram. Returns the payload length accepted into the device
/// queue; `NetError::Unresolved` marks a datagram deferred behind ARP.
pub fn output(
    core: &NetCore,
    protocol: u8,
    data: &[u8],
    src: IpAddr,
    dst: IpAddr,
) -> Result<usize, NetError> {
    let (iface, nexthop) = if dst == IpAddr::BROADCAST {
        if src == IpAddr::ANY {
            return Err(NetError::Invalid(
                "limited broadcast needs a source address",
            ));
        }
        let iface = core
            .ip
            .iface_by_addr(src)
            .ok_or_else(|| NetError::IfaceNotFound(src.to_string()))?;
        (iface, dst)
    } else {
        let route = core
            .ip
            .routes
            .lookup(dst)
            .ok_or_else(|| NetError::NoRoute(dst.to_string()))?;
        let nexthop = if route.nexthop != IpAddr::ANY {
            route.nexthop
        } else {
            dst
        };
        (route.iface, nexthop)
    };
    let src = if src == IpAddr::ANY { iface.unicast } else { src };
    let limit = iface.device().mtu.saturating_sub(IP_HDR_SIZE_MIN);
    if data.len() > limit {
        // no fragmentation support
        return Err(NetError::TooLong {
            len: data.len(),
            limit,
        });
    }
    let id = core.ip.id_generator.generate();
    output_core(core, &iface, protocol, data, src, dst, nexthop, id, 0)?;
    Ok(data.len())
}

#[allow(clippy::too_many_arguments)]
fn output_core(
    core: &NetCore,
    iface: &Arc<IpIface>,
    protocol: u8,
    data: &[u8],
    src: IpAddr,
    dst: IpAddr,
    nexthop: IpAddr,
    id: u16,
    offset: u16,
) -> Result<(), NetError> {
    let total = (IP_HDR_SIZE_MIN + data.len()) as u16;
    let hdr = IpHeader::new(protocol, total, id, offset, src, dst).with_checksum();
    let mut packet = Vec::with_capacity(total as usize);
    packet.extend_from_slice(&hdr.to_bytes());
    packet.extend_from_slice(data);
    output_device(core, iface, &packet, nexthop)
}

/// Resolves the link-layer destination and hands the packet to the device
/// queue: NOARP devices get an all-zero address, broadcast destinations
/// the device broadcast, everything else goes through ARP.
fn output_device(
    core: &NetCore,
    iface: &Arc<IpIface>,
    packet: &[u8],
    nexthop: IpAddr,
) -> Result<(), NetError> {
    let dev = iface.device();
    let mut ha = [0u8; NET_DEVICE_ADDR_LEN];
    if dev.flags() & NET_DEVICE_FLAG_NOARP == 0 {
        if nexthop == iface.broadcast || nexthop == IpAddr::BROADCAST {
            ha.copy_from_slice(&dev.broadcast);
        } else {
            match arp::resolve(core, iface, nexthop)? {
                ArpResult::Found(addr) => ha[..addr.len()].copy_from_slice(&addr),
                ArpResult::Incomplete => {
                    // unresolved at the moment; the caller may retry
                    return Err(NetError::Unresolved(nexthop.to_string()));
                }
            }
        }
    }
    debug!("<{}> {} bytes to {}", dev.name, packet.len(), nexthop);
    dev.transmit(ETHERTYPE_IP, packet, &ha[..dev.address_len as usize])
}

/// Hooks IPv4 into the link-level dispatch.
pub fn init(core: &NetCore) -> Result<(), NetError> {
    core.protocol_register(ETHERTYPE_IP, Box::new(input))
}
