//! HAProxy PROXY protocol, versions 1 and 2.
//!
//! A proxy hop prepends one header to the stream carrying the original client
//! and destination addresses. Version 2 is a binary block behind a fixed
//! 12-byte signature; version 1 is a single text line:
//!
//! ```text
//! PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\n
//! ```

use super::cursor::Cursor;
use super::{Decode, DecodeResult};
use crate::error::CodecError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Version 2 signature.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
/// Signature, version/command, family and length.
pub const V2_HEADER_SIZE: usize = 16;
/// Longest legal version 1 line, CRLF included.
pub const V1_MAX_LINE: usize = 108;

const V1_PREFIX: &[u8] = b"PROXY";

const V2_CMD_LOCAL: u8 = 0x0;
const V2_CMD_PROXY: u8 = 0x1;
const V2_FAM_TCP4: u8 = 0x11;
const V2_FAM_TCP6: u8 = 0x21;

/// Original endpoints announced by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedAddrs {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Command {
    /// Health check or proxy-originated connection; keep local addresses.
    Local,
    Proxy,
}

/// A decoded header in one of its two shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyHeader {
    V1 {
        /// Protocol token (`TCP4`, `TCP6`, `UNKNOWN`, ...).
        protocol: String,
        addrs: Option<ProxiedAddrs>,
    },
    V2 {
        command: V2Command,
        family: u8,
        addrs: Option<ProxiedAddrs>,
    },
}

impl ProxyHeader {
    /// Addresses to stamp on the connection, if the header carried any.
    pub fn addrs(&self) -> Option<ProxiedAddrs> {
        match self {
            ProxyHeader::V1 { addrs, .. } | ProxyHeader::V2 { addrs, .. } => *addrs,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            ProxyHeader::V1 { .. } => 1,
            ProxyHeader::V2 { .. } => 2,
        }
    }
}

/// Decode a proxy header from the front of `data`.
///
/// Input that cannot be a proxy header at all is reported as
/// [`CodecError::Unrecognized`].
pub fn decode(data: &[u8]) -> DecodeResult<ProxyHeader> {
    if data.len() < V2_SIGNATURE.len() && V2_SIGNATURE.starts_with(data) && !data.is_empty() {
        return Ok(Decode::Incomplete);
    }
    if data.starts_with(&V2_SIGNATURE) {
        return decode_v2(data);
    }
    if data.len() < V1_PREFIX.len() && V1_PREFIX.starts_with(data) && !data.is_empty() {
        return Ok(Decode::Incomplete);
    }
    if data.starts_with(V1_PREFIX) {
        return decode_v1(data);
    }
    Err(CodecError::Unrecognized("proxy protocol"))
}

fn decode_v2(data: &[u8]) -> DecodeResult<ProxyHeader> {
    let mut cur = Cursor::new(data);
    let _ = cur.skip(V2_SIGNATURE.len());
    let (Some(ver_cmd), Some(family), Some(len)) = (cur.u8(), cur.u8(), cur.u16_be()) else {
        return Ok(Decode::Incomplete);
    };

    if ver_cmd >> 4 != 2 {
        return Err(CodecError::malformed(
            "proxy v2 header",
            format!("version {}", ver_cmd >> 4),
        ));
    }

    let Some(block) = cur.bytes(len as usize) else {
        return Ok(Decode::Incomplete);
    };
    let consumed = V2_HEADER_SIZE + len as usize;

    let command = match ver_cmd & 0x0F {
        V2_CMD_LOCAL => V2Command::Local,
        V2_CMD_PROXY => V2Command::Proxy,
        other => {
            return Err(CodecError::malformed(
                "proxy v2 header",
                format!("command {other}"),
            ))
        }
    };

    let addrs = match (command, family) {
        (V2Command::Proxy, V2_FAM_TCP4) => v2_inet4(block),
        (V2Command::Proxy, V2_FAM_TCP6) => v2_inet6(block),
        _ => None,
    };

    Ok(Decode::Complete {
        value: ProxyHeader::V2 {
            command,
            family,
            addrs,
        },
        consumed,
    })
}

fn v2_inet4(block: &[u8]) -> Option<ProxiedAddrs> {
    let mut cur = Cursor::new(block);
    let src = Ipv4Addr::from(cur.u32_be()?);
    let dst = Ipv4Addr::from(cur.u32_be()?);
    let src_port = cur.u16_be()?;
    let dst_port = cur.u16_be()?;
    Some(ProxiedAddrs {
        source: SocketAddr::new(IpAddr::V4(src), src_port),
        destination: SocketAddr::new(IpAddr::V4(dst), dst_port),
    })
}

fn v2_inet6(block: &[u8]) -> Option<ProxiedAddrs> {
    let mut cur = Cursor::new(block);
    let src: [u8; 16] = cur.bytes(16)?.try_into().ok()?;
    let dst: [u8; 16] = cur.bytes(16)?.try_into().ok()?;
    let src_port = cur.u16_be()?;
    let dst_port = cur.u16_be()?;
    Some(ProxiedAddrs {
        source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
        destination: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
    })
}

fn decode_v1(data: &[u8]) -> DecodeResult<ProxyHeader> {
    let window = &data[..data.len().min(V1_MAX_LINE)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if data.len() < V1_MAX_LINE {
            return Ok(Decode::Incomplete);
        }
        return Err(CodecError::malformed(
            "proxy v1 header",
            format!("no line end within {V1_MAX_LINE} bytes"),
        ));
    };
    let consumed = end + 2;

    // A line that is not ASCII or lacks the right tokens is still consumed,
    // it just carries no addresses.
    let line = std::str::from_utf8(&data[..end]).unwrap_or("");
    let tokens: Vec<&str> = line.split(' ').collect();
    let protocol = tokens.get(1).copied().unwrap_or_default().to_string();
    let addrs = if tokens.len() == 6 {
        v1_addrs(&tokens)
    } else {
        None
    };

    Ok(Decode::Complete {
        value: ProxyHeader::V1 { protocol, addrs },
        consumed,
    })
}

fn v1_addrs(tokens: &[&str]) -> Option<ProxiedAddrs> {
    let (src, dst): (IpAddr, IpAddr) = match tokens[1] {
        "TCP4" => (
            IpAddr::V4(tokens[2].parse().ok()?),
            IpAddr::V4(tokens[3].parse().ok()?),
        ),
        "TCP6" => (
            IpAddr::V6(tokens[2].parse().ok()?),
            IpAddr::V6(tokens[3].parse().ok()?),
        ),
        _ => return None,
    };
    let src_port: u16 = tokens[4].parse().ok()?;
    let dst_port: u16 = tokens[5].parse().ok()?;
    Some(ProxiedAddrs {
        source: SocketAddr::new(src, src_port),
        destination: SocketAddr::new(dst, dst_port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2(ver_cmd: u8, family: u8, block: &[u8]) -> Vec<u8> {
        let mut out = V2_SIGNATURE.to_vec();
        out.push(ver_cmd);
        out.push(family);
        out.extend_from_slice(&(block.len() as u16).to_be_bytes());
        out.extend_from_slice(block);
        out
    }

    fn inet4_block() -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&[10, 0, 0, 1]);
        block.extend_from_slice(&[192, 168, 1, 2]);
        block.extend_from_slice(&4000u16.to_be_bytes());
        block.extend_from_slice(&443u16.to_be_bytes());
        block
    }

    #[test]
    fn test_v2_waits_for_declared_length() {
        let header = v2(0x21, 0x11, &inet4_block());
        assert_eq!(decode(&header[..20]).unwrap(), Decode::Incomplete);
    }

    #[test]
    fn test_v2_proxy_inet4() {
        let mut data = v2(0x21, 0x11, &inet4_block());
        data.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let Decode::Complete { value, consumed } = decode(&data).unwrap() else {
            panic!("expected a header");
        };
        assert_eq!(consumed, 16 + 12);
        let addrs = value.addrs().unwrap();
        assert_eq!(addrs.source, "10.0.0.1:4000".parse().unwrap());
        assert_eq!(addrs.destination, "192.168.1.2:443".parse().unwrap());
    }

    #[test]
    fn test_v2_local_consumes_without_addrs() {
        let data = v2(0x20, 0x00, &[0u8; 7]);
        let Decode::Complete { value, consumed } = decode(&data).unwrap() else {
            panic!("expected a header");
        };
        assert_eq!(consumed, 23);
        assert_eq!(value.addrs(), None);
    }

    #[test]
    fn test_v2_unsupported_family_consumes() {
        let data = v2(0x21, 0x31, &[0u8; 216]);
        let Decode::Complete { value, consumed } = decode(&data).unwrap() else {
            panic!("expected a header");
        };
        assert_eq!(consumed, 16 + 216);
        assert_eq!(value.addrs(), None);
    }

    #[test]
    fn test_v2_inet6() {
        let mut block = Vec::new();
        block.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        block.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        block.extend_from_slice(&1234u16.to_be_bytes());
        block.extend_from_slice(&80u16.to_be_bytes());
        let data = v2(0x21, 0x21, &block);

        let Decode::Complete { value, .. } = decode(&data).unwrap() else {
            panic!("expected a header");
        };
        assert_eq!(
            value.addrs().unwrap().source,
            "[2001:db8::1]:1234".parse().unwrap()
        );
    }

    #[test]
    fn test_v2_bad_version() {
        let data = v2(0x11, 0x11, &inet4_block());
        assert!(matches!(decode(&data), Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn test_v1_tcp4() {
        let data = b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nhello";
        let Decode::Complete { value, consumed } = decode(data).unwrap() else {
            panic!("expected a header");
        };
        assert_eq!(consumed, data.len() - 5);
        assert_eq!(value.version(), 1);
        assert_eq!(
            value.addrs().unwrap().source,
            "192.168.0.1:56324".parse().unwrap()
        );
    }

    #[test]
    fn test_v1_wrong_token_count_still_consumed() {
        let data = b"PROXY UNKNOWN\r\nrest";
        let Decode::Complete { value, consumed } = decode(data).unwrap() else {
            panic!("expected a header");
        };
        assert_eq!(consumed, 15);
        assert_eq!(value.addrs(), None);
    }

    #[test]
    fn test_v1_needs_line_end() {
        assert_eq!(decode(b"PROXY TCP4 1.2.3.4").unwrap(), Decode::Incomplete);
        assert_eq!(decode(b"PRO").unwrap(), Decode::Incomplete);

        let mut long = b"PROXY ".to_vec();
        long.extend_from_slice(&[b'x'; 120]);
        assert!(decode(&long).is_err());
    }

    #[test]
    fn test_v2_signature_is_haproxy_quit() {
        assert_eq!(&V2_SIGNATURE, b"\r\n\r\n\0\r\nQUIT\n");

        let mut quin = v2(0x21, 0x11, &inet4_block());
        quin[10] = b'N';
        assert_eq!(
            decode(&quin),
            Err(CodecError::Unrecognized("proxy protocol"))
        );
    }

    #[test]
    fn test_not_proxy() {
        assert_eq!(
            decode(b"GET / HTTP/1.1\r\n"),
            Err(CodecError::Unrecognized("proxy protocol"))
        );
    }
}
