use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 address type tags
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Error type for target address encoding/decoding
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),

    #[error("invalid port in address {0:?}")]
    InvalidPort(String),

    #[error("invalid host in address {0:?}")]
    InvalidHost(String),

    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("truncated address: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("unknown address type {0:#04x}")]
    UnknownType(u8),
}

pub type AddrResult<T> = Result<T, AddrError>;

/// A decoded SOCKS5-style target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Split `host:port`, accepting `[v6]:port`. Bare IPv6 without brackets is rejected.
pub fn split_host_port(host_port: &str) -> AddrResult<(&str, u16)> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| AddrError::MissingPort(host_port.to_string()))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| AddrError::InvalidHost(host_port.to_string()))?,
        None if host.contains(':') => return Err(AddrError::InvalidHost(host_port.to_string())),
        None => host,
    };
    if host.is_empty() {
        return Err(AddrError::InvalidHost(host_port.to_string()));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| AddrError::InvalidPort(host_port.to_string()))?;
    Ok((host, port))
}

/// Encode `host:port` as ATYP + address + big-endian port.
pub fn parse_addr(host_port: &str) -> AddrResult<Bytes> {
    let (host, port) = split_host_port(host_port)?;

    let mut buf = BytesMut::with_capacity(host.len() + 4);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > u8::MAX as usize {
                return Err(AddrError::DomainTooLong(host.len()));
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_u16(port);
    Ok(buf.freeze())
}

/// Decode an encoded target address, returning it with the number of bytes consumed.
pub fn decode_addr(buf: &[u8]) -> AddrResult<(TargetAddr, usize)> {
    let need = |needed: usize| -> AddrResult<()> {
        if buf.len() < needed {
            Err(AddrError::Truncated {
                needed,
                have: buf.len(),
            })
        } else {
            Ok(())
        }
    };

    need(1)?;
    match buf[0] {
        ATYP_IPV4 => {
            need(7)?;
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok((TargetAddr::Ip(SocketAddr::new(ip.into(), port)), 7))
        }
        ATYP_IPV6 => {
            need(19)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            let ip = Ipv6Addr::from(octets);
            Ok((TargetAddr::Ip(SocketAddr::new(ip.into(), port)), 19))
        }
        ATYP_DOMAIN => {
            need(2)?;
            let len = buf[1] as usize;
            need(2 + len + 2)?;
            let host = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Ok((TargetAddr::Domain(host, port), 4 + len))
        }
        other => Err(AddrError::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ipv4() {
        let encoded = parse_addr("93.184.216.34:443").unwrap();
        assert_eq!(&encoded[..], &[0x01, 93, 184, 216, 34, 0x01, 0xbb]);
    }

    #[test]
    fn encodes_domain() {
        let encoded = parse_addr("example.com:80").unwrap();
        assert_eq!(encoded[0], ATYP_DOMAIN);
        assert_eq!(encoded[1], 11);
        assert_eq!(&encoded[2..13], b"example.com");
        assert_eq!(&encoded[13..], &[0x00, 0x50]);
    }

    #[test]
    fn encodes_bracketed_ipv6() {
        let encoded = parse_addr("[::1]:8080").unwrap();
        assert_eq!(encoded.len(), 19);
        assert_eq!(encoded[0], ATYP_IPV6);
        assert_eq!(encoded[16], 1);
    }

    #[test]
    fn round_trips_host_and_port() {
        for input in ["example.com:443", "10.0.0.1:80", "[2001:db8::1]:53", "a.b.c.d.e:65535"] {
            let encoded = parse_addr(input).unwrap();
            let (decoded, used) = decode_addr(&encoded).unwrap();
            assert_eq!(used, encoded.len());
            assert_eq!(decoded.to_string(), input);
        }
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(parse_addr("example.com"), Err(AddrError::MissingPort(_))));
        assert!(matches!(parse_addr("example.com:http"), Err(AddrError::InvalidPort(_))));
        assert!(matches!(parse_addr("example.com:70000"), Err(AddrError::InvalidPort(_))));
        assert!(matches!(parse_addr(":80"), Err(AddrError::InvalidHost(_))));
        assert!(matches!(parse_addr("::1:80"), Err(AddrError::InvalidHost(_))));

        let long = format!("{}:80", "a".repeat(256));
        assert_eq!(parse_addr(&long), Err(AddrError::DomainTooLong(256)));
    }

    #[test]
    fn decode_reports_truncation() {
        assert!(matches!(
            decode_addr(&[ATYP_IPV4, 1, 2]),
            Err(AddrError::Truncated { needed: 7, have: 3 })
        ));
        assert_eq!(decode_addr(&[0x09]), Err(AddrError::UnknownType(0x09)));
    }
}
