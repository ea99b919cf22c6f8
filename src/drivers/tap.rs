use crate::devices::ethernet;
use crate::devices::{NetDevice, NetDriver, NET_DEVICE_ADDR_LEN};
use crate::error::NetError;
use crate::net::NetCore;
use ifstructs::ifreq;
use log::debug;
use nix::{
    ioctl_read_bad, ioctl_write_ptr,
    libc::{IFF_NO_PI, IFF_TAP, O_NONBLOCK, SIOCGIFHWADDR},
    sys::socket::{socket, AddressFamily, SockFlag, SockType},
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex};

const TUN_PATH: &str = "/dev/net/tun";
const TUN_IOC_MAGIC: u8 = b'T';
const TUN_IOC_SET_IFF: u8 = 202;

const AF_INET_RAW: u16 = 2;

// Attaches a tun fd to a tap interface.
ioctl_write_ptr!(tun_set_iff, TUN_IOC_MAGIC, TUN_IOC_SET_IFF, ifreq);

// Reads the hardware address of an interface. SIOC* requests predate the
// ioctl direction/size encoding, hence the _bad variant.
ioctl_read_bad!(get_hw_addr, SIOCGIFHWADDR, ifreq);

/// Linux TAP backend. The fd is non-blocking; the worker polls it one
/// frame at a time.
pub struct TapDriver {
    ifname: String,
    file: Mutex<Option<File>>,
}

impl TapDriver {
    pub fn new(ifname: &str) -> TapDriver {
        TapDriver {
            ifname: ifname.to_string(),
            file: Mutex::new(None),
        }
    }

    fn hardware_address(&self) -> Result<[u8; NET_DEVICE_ADDR_LEN], NetError> {
        let soc = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .map_err(|err| NetError::Device(format!("socket() failure: {err}")))?;
        let mut ifr = ifreq::from_name(&self.ifname)?;
        let mut address = [0u8; NET_DEVICE_ADDR_LEN];
        // SAFETY: SIOCGIFHWADDR fills ifr_hwaddr for a named interface
        unsafe {
            ifr.ifr_ifru.ifr_addr.sa_family = AF_INET_RAW;
            get_hw_addr(soc, &mut ifr).map_err(|err| {
                NetError::Device(format!("SIOCGIFHWADDR failure on {}: {err}", self.ifname))
            })?;
            for (dst, src) in address.iter_mut().zip(ifr.ifr_ifru.ifr_hwaddr.sa_data.iter()) {
                *dst = *src as u8;
            }
        }
        let _ = nix::unistd::close(soc);
        Ok(address)
    }
}

impl NetDriver for TapDriver {
    fn open(&self) -> Result<Option<[u8; NET_DEVICE_ADDR_LEN]>, NetError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_NONBLOCK)
            .open(TUN_PATH)?;
        let mut ifr = ifreq::from_name(&self.ifname)?;
        ifr.set_flags((IFF_TAP | IFF_NO_PI) as i16);
        // SAFETY: TUNSETIFF on a fresh tun fd with an initialized ifreq
        unsafe {
            tun_set_iff(file.as_raw_fd(), &ifr).map_err(|err| {
                NetError::Device(format!("TUNSETIFF failure on {}: {err}", self.ifname))
            })?;
        }
        let address = self.hardware_address()?;
        debug!(
            "tap {} attached, hwaddr={}",
            self.ifname,
            ethernet::mac_addr_ntop(&address)
        );
        *self.file.lock().unwrap() = Some(file);
        Ok(Some(address))
    }

    fn close(&self) {
        self.file.lock().unwrap().take();
    }

    fn transmit(
        &self,
        dev: &NetDevice,
        ethertype: u16,
        data: &[u8],
        dst: &[u8],
    ) -> Result<(), NetError> {
        ethernet::transmit_helper(dev, ethertype, data, dst, |frame| {
            let mut guard = self.file.lock().unwrap();
            match guard.as_mut() {
                Some(file) => file.write(frame),
                None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            }
        })
    }

    fn poll(&self, core: &NetCore, dev: &Arc<NetDevice>) -> bool {
        ethernet::poll_helper(core, dev, |buf| {
            let mut guard = self.file.lock().unwrap();
            match guard.as_mut() {
                Some(file) => file.read(buf),
                None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
            }
        })
    }
}
