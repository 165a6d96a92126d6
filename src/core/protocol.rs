//! Addressing header
//!
//! The first decrypted payload of a stream, and every decrypted datagram,
//! starts with a SOCKS5-style address:
//! - tag (1 byte): 1 = IPv4, 3 = domain name, 4 = IPv6
//! - address: 4 bytes, length-prefixed host, or 16 bytes
//! - port (2 bytes, big-endian)
//!
//! Whatever follows is application payload.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;

use crate::error::HandlerError;

const TAG_IPV4: u8 = 1;
const TAG_DOMAIN: u8 = 3;
const TAG_IPV6: u8 = 4;

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4], u16),
    IPv6([u8; 16], u16),
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Address::IPv4(ip.octets(), addr.port()),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(v4) => Address::IPv4(v4.octets(), addr.port()),
                None => Address::IPv6(ip.octets(), addr.port()),
            },
        }
    }
}

/// Address decode result
#[derive(Debug)]
pub enum DecodeResult<T> {
    /// Decoded value and bytes consumed
    Ok(T, usize),
    NeedMoreData,
    Invalid(&'static str),
}

fn read_port(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

impl Address {
    pub fn decode(buf: &[u8]) -> DecodeResult<Self> {
        let Some(&tag) = buf.first() else {
            return DecodeResult::NeedMoreData;
        };

        match tag {
            TAG_IPV4 => {
                const LEN: usize = 1 + 4 + 2;
                if buf.len() < LEN {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                DecodeResult::Ok(Address::IPv4(ip, read_port(buf, 5)), LEN)
            }
            TAG_IPV6 => {
                const LEN: usize = 1 + 16 + 2;
                if buf.len() < LEN {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                DecodeResult::Ok(Address::IPv6(ip, read_port(buf, 17)), LEN)
            }
            TAG_DOMAIN => {
                let Some(&host_len) = buf.get(1) else {
                    return DecodeResult::NeedMoreData;
                };
                let host_len = host_len as usize;
                let len = 2 + host_len + 2;
                if buf.len() < len {
                    return DecodeResult::NeedMoreData;
                }
                let Ok(host) = std::str::from_utf8(&buf[2..2 + host_len]) else {
                    return DecodeResult::Invalid("domain is not valid UTF-8");
                };
                if host.is_empty() {
                    return DecodeResult::Invalid("empty domain");
                }
                DecodeResult::Ok(
                    Address::Domain(host.to_string(), read_port(buf, 2 + host_len)),
                    len,
                )
            }
            _ => DecodeResult::Invalid("unknown address tag"),
        }
    }

    /// Append the wire form to `buf`, returning the bytes written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        match self {
            Address::IPv4(ip, port) => {
                buf.push(TAG_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(TAG_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(host, port) => {
                let host = &host.as_bytes()[..host.len().min(u8::MAX as usize)];
                buf.push(TAG_DOMAIN);
                buf.push(host.len() as u8);
                buf.extend_from_slice(host);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf.len() - start
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) | Address::IPv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(host, _) => host.clone(),
        }
    }

    /// Resolve to a socket address; domains go through the system resolver
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::from((Ipv4Addr::from(*ip), *port))),
            Address::IPv6(ip, port) => Ok(SocketAddr::from((Ipv6Addr::from(*ip), *port))),
            Address::Domain(host, port) => lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", host),
                    )
                }),
        }
    }
}

/// Split a decrypted payload into its destination and remaining bytes.
///
/// A header that does not fit in `data` is rejected; it is never buffered
/// across chunks.
pub fn parse_header(data: &Bytes) -> Result<(Address, Bytes), HandlerError> {
    match Address::decode(data) {
        DecodeResult::Ok(addr, consumed) => Ok((addr, data.slice(consumed..))),
        DecodeResult::NeedMoreData => Err(HandlerError::Header("header too short")),
        DecodeResult::Invalid(reason) => Err(HandlerError::Header(reason)),
    }
}
