use anyhow::{Result, anyhow};
use std::net::{IpAddr, Ipv4Addr};

pub const COMPACT_PEER_LENGTH: usize = 6;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

pub type PeerId = [u8; 20];
pub type PeerAddr = String;

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Decodes a compact entry: 4-byte IPv4 address followed by a big-endian port.
    pub fn from_compact(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMPACT_PEER_LENGTH {
            return Err(anyhow!(
                "compact peer entry must be {} bytes, got {}",
                COMPACT_PEER_LENGTH,
                bytes.len()
            ));
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Ok(Self::new(IpAddr::V4(ip), port))
    }

    pub fn get_addr(&self) -> PeerAddr {
        if self.ip.is_ipv6() {
            format!("[{}]:{}", &self.ip, &self.port)
        } else {
            format!("{}:{}", &self.ip, &self.port)
        }
    }
}
