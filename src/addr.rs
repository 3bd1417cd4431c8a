//! Address and identity value types.
//!
//! [`Addr`] is the key every repository is indexed by: an IPv4 address and a
//! non-zero port. [`PublicAddr`] is the same value restricted to routable
//! addresses and is the only form accepted from untrusted report sources.
//! [`InstanceId`] is the opaque token a game server process attaches to its
//! reports so that later keepalive/removal requests can be cross-checked.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddrError;

/// Longest instance token accepted from a reporter.
pub const MAX_INSTANCE_ID_LEN: usize = 16;

/// IPv4 address plus a port in the range 1..=65535.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr {
    ip: Ipv4Addr,
    port: u16,
}

impl Addr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Result<Self, AddrError> {
        if port == 0 {
            return Err(AddrError::InvalidPort(port));
        }
        Ok(Self { ip, port })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port. Used to address the query port of a server.
    pub fn with_port(&self, port: u16) -> Result<Self, AddrError> {
        Self::new(self.ip, port)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: SocketAddrV4 = s
            .parse()
            .map_err(|_| AddrError::Malformed(s.to_string()))?;
        Self::new(*parsed.ip(), parsed.port())
    }
}

impl TryFrom<SocketAddr> for Addr {
    type Error = AddrError;

    fn try_from(value: SocketAddr) -> Result<Self, Self::Error> {
        match value {
            SocketAddr::V4(v4) => Self::new(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Err(AddrError::Malformed(v6.to_string())),
        }
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An [`Addr`] that is routable on the public internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicAddr(Addr);

impl PublicAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Result<Self, AddrError> {
        if !is_public(ip) {
            return Err(AddrError::NotPublic(ip));
        }
        Addr::new(ip, port).map(Self)
    }

    pub fn addr(&self) -> Addr {
        self.0
    }
}

impl TryFrom<Addr> for PublicAddr {
    type Error = AddrError;

    fn try_from(addr: Addr) -> Result<Self, Self::Error> {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<PublicAddr> for Addr {
    fn from(value: PublicAddr) -> Self {
        value.0
    }
}

impl fmt::Display for PublicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn is_public(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation())
}

/// Opaque token identifying a reporting game server process.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(Vec<u8>);

impl InstanceId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, AddrError> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > MAX_INSTANCE_ID_LEN {
            return Err(AddrError::InstanceIdLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, AddrError> {
        let bytes = hex::decode(s).map_err(|_| AddrError::Malformed(s.to_string()))?;
        Self::new(bytes)
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.to_hex())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_and_port() {
        let addr: Addr = "1.1.1.1:10480".parse().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(addr.port(), 10480);
        assert_eq!(addr.to_string(), "1.1.1.1:10480");
    }

    #[test]
    fn rejects_zero_port() {
        assert!(matches!(
            Addr::new(Ipv4Addr::new(1, 1, 1, 1), 0),
            Err(AddrError::InvalidPort(0))
        ));
        assert!("1.1.1.1:0".parse::<Addr>().is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!("1.1.1.1".parse::<Addr>().is_err());
        assert!("localhost:10480".parse::<Addr>().is_err());
        assert!("[::1]:10480".parse::<Addr>().is_err());
    }

    #[test]
    fn public_addr_excludes_private_ranges() {
        for ip in ["10.0.0.1", "192.168.1.1", "172.16.0.5", "127.0.0.1", "0.0.0.0", "169.254.0.1"] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            assert!(
                matches!(PublicAddr::new(ip, 10480), Err(AddrError::NotPublic(_))),
                "{ip} accepted"
            );
        }
        let public = PublicAddr::new(Ipv4Addr::new(81, 19, 209, 212), 10480).unwrap();
        assert_eq!(Addr::from(public).to_string(), "81.19.209.212:10480");
    }

    #[test]
    fn instance_id_bounds() {
        assert!(InstanceId::new(Vec::new()).is_err());
        assert!(InstanceId::new(vec![0u8; MAX_INSTANCE_ID_LEN + 1]).is_err());
        let id = InstanceId::new(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert_eq!(id.to_hex(), "deadbeef");
        assert_eq!(InstanceId::from_hex("deadbeef").unwrap(), id);
    }

    #[test]
    fn serde_uses_string_form() {
        let addr: Addr = "2.2.2.2:10480".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"2.2.2.2:10480\"");
        let back: Addr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
