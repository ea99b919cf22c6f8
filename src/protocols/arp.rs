use crate::devices::ethernet::{
    mac_addr_ntop, ETHERTYPE_ARP, ETH_ADDR_ANY, ETH_ADDR_LEN,
};
use crate::devices::{NetDevice, NetDeviceType};
use crate::error::NetError;
use crate::net::NetCore;
use crate::protocols::ip::{IpAddr, IpIface, IP_ADDR_LEN};
use crate::utils::byte::{hton16, ntoh16};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const ARP_HRD_ETHER: u16 = 0x0001;
const ARP_PRO_IP: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

pub const ARP_MSG_SIZE: usize = 28;

const ARP_CACHE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 4);

/// Resolution outcome. `Incomplete` means a request was broadcast and the
/// caller should treat its datagram as deferred until the reply lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpResult {
    Found([u8; ETH_ADDR_LEN]),
    Incomplete,
}

struct ArpCacheEntry {
    hw_addr: [u8; ETH_ADDR_LEN],
    timestamp: Instant,
}

pub struct ArpTable {
    entries: Mutex<HashMap<IpAddr, ArpCacheEntry>>,
}

impl ArpTable {
    pub(crate) fn new() -> ArpTable {
        ArpTable {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache lookup; stale entries are evicted on access.
    pub fn get(&self, ip: IpAddr) -> Option<[u8; ETH_ADDR_LEN]> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&ip) {
            Some(entry) if entry.timestamp.elapsed() > ARP_CACHE_TIMEOUT => {
                entries.remove(&ip);
                None
            }
            Some(entry) => Some(entry.hw_addr),
            None => None,
        }
    }

    pub fn update(&self, ip: IpAddr, hw_addr: [u8; ETH_ADDR_LEN]) {
        self.entries.lock().unwrap().insert(
            ip,
            ArpCacheEntry {
                hw_addr,
                timestamp: Instant::now(),
            },
        );
    }
}

/// ARP message for Ethernet/IPv4 (unit: octet)
/// [ hrd: 2 | pro: 2 | hln: 1 | pln: 1 | op: 2 | sha: 6 | spa: 4 | tha: 6 | tpa: 4 ]
#[repr(C, packed)]
struct ArpMessage {
    hrd: u16,
    pro: u16,
    hln: u8,
    pln: u8,
    op: u16,
    sha: [u8; ETH_ADDR_LEN],
    spa: [u8; IP_ADDR_LEN],
    tha: [u8; ETH_ADDR_LEN],
    tpa: [u8; IP_ADDR_LEN],
}

impl ArpMessage {
    fn new(
        op: u16,
        sha: [u8; ETH_ADDR_LEN],
        spa: IpAddr,
        tha: [u8; ETH_ADDR_LEN],
        tpa: IpAddr,
    ) -> ArpMessage {
        ArpMessage {
            hrd: hton16(ARP_HRD_ETHER),
            pro: hton16(ARP_PRO_IP),
            hln: ETH_ADDR_LEN as u8,
            pln: IP_ADDR_LEN as u8,
            op: hton16(op),
            sha,
            spa: spa.to_bytes(),
            tha,
            tpa: tpa.to_bytes(),
        }
    }

    fn to_bytes(&self) -> [u8; ARP_MSG_SIZE] {
        // SAFETY: repr(C, packed) with no padding, exactly ARP_MSG_SIZE bytes
        unsafe { std::mem::transmute_copy(self) }
    }

    fn from_bytes(data: &[u8]) -> Option<ArpMessage> {
        if data.len() < ARP_MSG_SIZE {
            return None;
        }
        // SAFETY: length checked above; the packed layout has no alignment
        // requirement beyond one byte
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const ArpMessage) })
    }
}

fn device_addr(dev: &NetDevice) -> [u8; ETH_ADDR_LEN] {
    let mut addr = [0; ETH_ADDR_LEN];
    addr.copy_from_slice(&dev.address[..ETH_ADDR_LEN]);
    addr
}

fn request(iface: &IpIface, target: IpAddr) -> Result<(), NetError> {
    let dev = iface.device();
    let msg = ArpMessage::new(
        ARP_OP_REQUEST,
        device_addr(dev),
        iface.unicast,
        ETH_ADDR_ANY,
        target,
    );
    debug!("<{}> arp request: who has {}", dev.name, target);
    dev.transmit(
        ETHERTYPE_ARP,
        &msg.to_bytes(),
        &dev.broadcast[..ETH_ADDR_LEN],
    )
}

fn reply(
    iface: &IpIface,
    tha: [u8; ETH_ADDR_LEN],
    tpa: IpAddr,
    dst: [u8; ETH_ADDR_LEN],
) -> Result<(), NetError> {
    let dev = iface.device();
    let msg = ArpMessage::new(ARP_OP_REPLY, device_addr(dev), iface.unicast, tha, tpa);
    debug!("<{}> arp reply: {} is at {}", dev.name, iface.unicast, mac_addr_ntop(&msg.sha));
    dev.transmit(ETHERTYPE_ARP, &msg.to_bytes(), &dst)
}

/// Handles one ARP frame: when the target protocol address is ours, merge
/// the sender into the cache and answer requests.
pub fn input(core: &NetCore, dev: &Arc<NetDevice>, data: &[u8]) {
    let Some(msg) = ArpMessage::from_bytes(data) else {
        warn!("<{}> arp message too small: {} bytes", dev.name, data.len());
        return;
    };
    if ntoh16(msg.hrd) != ARP_HRD_ETHER || msg.hln as usize != ETH_ADDR_LEN {
        warn!("<{}> unsupported hardware address space", dev.name);
        return;
    }
    if ntoh16(msg.pro) != ARP_PRO_IP || msg.pln as usize != IP_ADDR_LEN {
        warn!("<{}> unsupported protocol address space", dev.name);
        return;
    }
    let spa = IpAddr::from_bytes(msg.spa);
    let tpa = IpAddr::from_bytes(msg.tpa);
    let Some(iface) = core.ip.iface_on_device(dev) else {
        return;
    };
    if iface.unicast != tpa {
        debug!("<{}> arp target {} is not ours", dev.name, tpa);
        return;
    }
    core.arp.update(spa, msg.sha);
    info!(
        "<{}> arp merged: {} is at {}",
        dev.name,
        spa,
        mac_addr_ntop(&msg.sha)
    );
    if ntoh16(msg.op) == ARP_OP_REQUEST {
        if let Err(err) = reply(&iface, msg.sha, spa, msg.sha) {
            warn!("<{}> arp reply failure: {}", dev.name, err);
        }
    }
}

/// Cache hit returns the hardware address. On a miss a request is
/// broadcast and the caller sees `Incomplete`; the reply will fill the
/// cache through `input`.
pub fn resolve(
    core: &NetCore,
    iface: &IpIface,
    target: IpAddr,
) -> Result<ArpResult, NetError> {
    if iface.device().device_type != NetDeviceType::Ethernet {
        return Err(NetError::Invalid("arp resolve on a non-ethernet device"));
    }
    if let Some(hw_addr) = core.arp.get(target) {
        return Ok(ArpResult::Found(hw_addr));
    }
    request(iface, target)?;
    Ok(ArpResult::Incomplete)
}

/// Hooks ARP into the link-level dispatch.
pub fn init(core: &NetCore) -> Result<(), NetError> {
    core.protocol_register(ETHERTYPE_ARP, Box::new(input))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::devices::ethernet::{self, mac_addr_pton, ETH_ADDR_BROADCAST};
    use crate::devices::null::NullDriver;
    use crate::net::NetStack;

    const OUR_MAC: &str = "52:54:00:11:22:33";
    const PEER_MAC: &str = "52:54:00:aa:bb:cc";

    fn eth_stack(addr: &str, netmask: &str) -> (NetStack, Arc<NetDevice>, Arc<IpIface>) {
        let stack = NetStack::new();
        let core = stack.core();
        let mut dev = ethernet::setup(Box::new(NullDriver));
        dev.address[..ETH_ADDR_LEN].copy_from_slice(&mac_addr_pton(OUR_MAC).unwrap());
        let dev = core.device_register(dev).unwrap();
        let iface = core
            .ip
            .iface_register(IpIface::alloc(&dev, addr, netmask).unwrap())
            .unwrap();
        (stack, dev, iface)
    }

    #[test]
    fn test_cache_update_and_get() {
        let table = ArpTable::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(table.get(ip).is_none());
        let mac = mac_addr_pton(PEER_MAC).unwrap();
        table.update(ip, mac);
        assert_eq!(table.get(ip), Some(mac));
    }

    #[test]
    fn test_request_goes_to_broadcast() {
        let (_stack, dev, iface) = eth_stack("10.0.0.2", "255.255.255.0");
        let target: IpAddr = "10.0.0.1".parse().unwrap();
        request(&iface, target).unwrap();

        let entry = dev.dequeue().unwrap();
        assert_eq!(entry.ethertype, ETHERTYPE_ARP);
        assert_eq!(&entry.dst[..ETH_ADDR_LEN], &ETH_ADDR_BROADCAST);
        let msg = ArpMessage::from_bytes(&entry.data).unwrap();
        assert_eq!(ntoh16(msg.op), ARP_OP_REQUEST);
        assert_eq!(msg.sha, mac_addr_pton(OUR_MAC).unwrap());
        assert_eq!(IpAddr::from_bytes(msg.spa), iface.unicast);
        assert_eq!(IpAddr::from_bytes(msg.tpa), target);
    }

    #[test]
    fn test_input_merges_and_replies() {
        let (stack, dev, iface) = eth_stack("10.0.0.2", "255.255.255.0");
        let core = stack.core();
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let peer_mac = mac_addr_pton(PEER_MAC).unwrap();

        let msg = ArpMessage::new(
            ARP_OP_REQUEST,
            peer_mac,
            peer,
            ETH_ADDR_ANY,
            iface.unicast,
        );
        input(core, &dev, &msg.to_bytes());

        // sender merged into the cache
        assert_eq!(core.arp.get(peer), Some(peer_mac));

        // a reply went back to the sender
        let entry = dev.dequeue().unwrap();
        assert_eq!(entry.ethertype, ETHERTYPE_ARP);
        assert_eq!(&entry.dst[..ETH_ADDR_LEN], &peer_mac);
        let reply = ArpMessage::from_bytes(&entry.data).unwrap();
        assert_eq!(ntoh16(reply.op), ARP_OP_REPLY);
        assert_eq!(reply.sha, mac_addr_pton(OUR_MAC).unwrap());
        assert_eq!(IpAddr::from_bytes(reply.spa), iface.unicast);
        assert_eq!(reply.tha, peer_mac);
        assert_eq!(IpAddr::from_bytes(reply.tpa), peer);
    }

    #[test]
    fn test_input_ignores_foreign_target() {
        let (stack, dev, _iface) = eth_stack("10.0.0.2", "255.255.255.0");
        let core = stack.core();
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.77".parse().unwrap();

        let msg = ArpMessage::new(
            ARP_OP_REQUEST,
            mac_addr_pton(PEER_MAC).unwrap(),
            peer,
            ETH_ADDR_ANY,
            other,
        );
        input(core, &dev, &msg.to_bytes());
        assert!(core.arp.get(peer).is_none());
        assert!(dev.dequeue().is_none());
    }

    #[test]
    fn test_resolve_miss_sends_request() {
        let (stack, dev, iface) = eth_stack("10.0.0.2", "255.255.255.0");
        let core = stack.core();
        let target: IpAddr = "10.0.0.1".parse().unwrap();

        assert_eq!(resolve(core, &iface, target).unwrap(), ArpResult::Incomplete);
        assert_eq!(dev.dequeue().unwrap().ethertype, ETHERTYPE_ARP);

        let target_mac = mac_addr_pton(PEER_MAC).unwrap();
        core.arp.update(target, target_mac);
        assert_eq!(
            resolve(core, &iface, target).unwrap(),
            ArpResult::Found(target_mac)
        );
    }
}
