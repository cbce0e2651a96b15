// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Serialize, Serializer};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use tokio::net::{TcpSocket, TcpStream};

/// BGP protocol port number
pub const BGP_PORT: u16 = 179;

/// IPv4 network prefix
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
pub struct Ipv4Net {
    pub address: Ipv4Addr,
    pub prefix_length: u8,
}

impl Ipv4Net {
    /// Builds a prefix with host bits cleared. Returns None for lengths above 32.
    pub fn new(address: Ipv4Addr, prefix_length: u8) -> Option<Self> {
        if prefix_length > 32 {
            return None;
        }
        Some(Ipv4Net {
            address: Ipv4Addr::from(u32::from(address) & Self::mask(prefix_length)),
            prefix_length,
        })
    }

    fn mask(prefix_length: u8) -> u32 {
        if prefix_length == 0 {
            0
        } else {
            !0u32 << (32 - prefix_length)
        }
    }

    /// Returns true if this is a multicast prefix (224.0.0.0/4).
    pub fn is_multicast(&self) -> bool {
        self.address.octets()[0] >= 224 && self.address.octets()[0] <= 239
    }

    /// Number of address bytes carried on the wire for this prefix.
    pub fn wire_len(&self) -> usize {
        (self.prefix_length as usize).div_ceil(8)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.prefix_length);
        (u32::from(self.address) & mask) == (u32::from(addr) & mask)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_length)
    }
}

/// Parse CIDR notation string into Ipv4Net
impl FromStr for Ipv4Net {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR format '{}' (expected address/length)", s))?;
        let prefix_length = len
            .parse::<u8>()
            .map_err(|_| format!("invalid prefix length '{}'", len))?;
        let address = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| format!("invalid IPv4 address '{}'", addr))?;
        Ipv4Net::new(address, prefix_length)
            .ok_or_else(|| format!("IPv4 prefix length {} exceeds 32", prefix_length))
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Ipv4Net {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Open an outbound TCP connection, binding to `local_ip` when given so the
/// peer sees the configured address.
pub async fn create_and_bind_tcp_socket(
    local_ip: Option<IpAddr>,
    remote_addr: SocketAddr,
) -> io::Result<TcpStream> {
    let socket = if remote_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(ip) = local_ip.filter(|ip| !ip.is_unspecified()) {
        socket.bind(SocketAddr::new(ip, 0))?;
    }

    socket.connect(remote_addr).await
}

/// Extract the peer IP address from a TcpStream.
/// Returns None if peer_addr() fails.
pub fn peer_ip(stream: &TcpStream) -> Option<IpAddr> {
    stream.peer_addr().ok().map(|addr| addr.ip())
}

/// Extract the local IPv4 address from a TcpStream, used as next hop self.
pub fn local_ipv4(stream: &TcpStream) -> Option<Ipv4Addr> {
    match stream.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

/// Parse address string into SocketAddr with optional default port.
/// Accepts formats: "IP:PORT" or "IP" (uses default_port).
pub fn parse_sockaddr(addr: &str, default_port: u16) -> Result<SocketAddr, String> {
    addr.parse()
        .or_else(|_| format!("{}:{}", addr, default_port).parse())
        .map_err(|e| format!("invalid address: {}", e))
}

/// Helper to create IPv4 IpAddr for tests
#[cfg(test)]
pub(crate) const fn ipv4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_sockaddr() {
        let cases = [
            (
                "127.0.0.1:179",
                179,
                Ok(SocketAddr::new(ipv4(127, 0, 0, 1), 179)),
            ),
            (
                "127.0.0.1",
                179,
                Ok(SocketAddr::new(ipv4(127, 0, 0, 1), 179)),
            ),
            (
                "10.0.0.1",
                8080,
                Ok(SocketAddr::new(ipv4(10, 0, 0, 1), 8080)),
            ),
        ];
        for (addr, default_port, expected) in cases {
            assert_eq!(parse_sockaddr(addr, default_port), expected);
        }

        assert!(parse_sockaddr("invalid", 179).is_err());
        assert!(parse_sockaddr("999.999.999.999", 179).is_err());
    }

    #[tokio::test]
    async fn test_peer_and_local_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, _) = listener.accept().await.unwrap();

        assert_eq!(peer_ip(&server_stream), Some(ipv4(127, 0, 0, 1)));
        assert_eq!(local_ipv4(&server_stream), Some(Ipv4Addr::LOCALHOST));

        let client_stream = client.await.unwrap();
        assert_eq!(peer_ip(&client_stream), Some(ipv4(127, 0, 0, 1)));
    }

    #[tokio::test]
    async fn test_create_and_bind_tcp_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = create_and_bind_tcp_socket(Some(ipv4(127, 0, 0, 1)), addr)
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        assert_eq!(peer_ip(&accepted), Some(ipv4(127, 0, 0, 1)));
        assert_eq!(local_ipv4(&stream), Some(Ipv4Addr::LOCALHOST));

        // Unspecified local address is not bound
        let stream = create_and_bind_tcp_socket(Some(ipv4(0, 0, 0, 0)), addr).await;
        assert!(stream.is_ok());
    }

    #[test]
    fn test_ipv4net_from_str() {
        assert_eq!(
            Ipv4Net::from_str("10.0.0.0/24").unwrap(),
            Ipv4Net {
                address: Ipv4Addr::new(10, 0, 0, 0),
                prefix_length: 24,
            }
        );
        // Host bits are cleared
        assert_eq!(
            Ipv4Net::from_str("10.0.0.7/24").unwrap().address,
            Ipv4Addr::new(10, 0, 0, 0)
        );
        assert_eq!(
            Ipv4Net::from_str("0.0.0.0/0").unwrap().to_string(),
            "0.0.0.0/0"
        );

        assert!(Ipv4Net::from_str("10.0.0.0").is_err());
        assert!(Ipv4Net::from_str("10.0.0.0/33").is_err());
        assert!(Ipv4Net::from_str("999.999.999.999/24").is_err());
        assert!(Ipv4Net::from_str("2001:db8::/32").is_err());
    }

    #[test]
    fn test_ipv4net_contains_and_wire_len() {
        let net: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(10, 1, 200, 3)));
        assert!(!net.contains(Ipv4Addr::new(10, 2, 0, 1)));
        assert_eq!(net.wire_len(), 2);

        let cases = [(0, 0), (1, 1), (8, 1), (9, 2), (24, 3), (25, 4), (32, 4)];
        for (len, bytes) in cases {
            let net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), len).unwrap();
            assert_eq!(net.wire_len(), bytes, "/{}", len);
        }
    }

    #[test]
    fn test_ipv4net_is_multicast() {
        let multicast: Ipv4Net = "224.0.0.0/24".parse().unwrap();
        assert!(multicast.is_multicast());

        let unicast: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert!(!unicast.is_multicast());
    }

    #[test]
    fn test_ipv4net_serde_as_string() {
        let net: Ipv4Net = "192.168.0.0/16".parse().unwrap();
        assert_eq!(serde_json::to_string(&net).unwrap(), "\"192.168.0.0/16\"");
        let parsed: Ipv4Net = serde_yaml::from_str("10.0.0.0/8").unwrap();
        assert_eq!(parsed.prefix_length, 8);
    }
}
