use thiserror::Error;

/// Error surface of the whole stack. `Unresolved` is transient: the ARP
/// request went out and the caller may retry once resolution completes.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("malformed address: {0}")]
    AddrParse(String),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("payload too long: {len} > {limit}")]
    TooLong { len: usize, limit: usize },
    #[error("ethertype 0x{0:04x} already registered")]
    DuplicateEthertype(u16),
    #[error("ip protocol {0} already registered")]
    DuplicateIpProtocol(u8),
    #[error("unsupported ethertype 0x{0:04x}")]
    UnsupportedEthertype(u16),
    #[error("no route to host: {0}")]
    NoRoute(String),
    #[error("interface not found for {0}")]
    IfaceNotFound(String),
    #[error("device <{0}> is down")]
    DeviceDown(String),
    #[error("hardware address for {0} not resolved yet")]
    Unresolved(String),
    #[error("device failure: {0}")]
    Device(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
