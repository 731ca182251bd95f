//! PROXY protocol v1 and v2 preamble parsing
//!
//! A load balancer in front of the proxy may prefix each connection with the
//! original client address. The preamble is read off the socket; anything
//! read past it is handed back so the caller can replay it.
//!
//! When the peer is not in the trusted list, or the preamble is missing or
//! malformed, the peer address is used as the client address.

use bytes::{Buf, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

const V1_PREFIX: &[u8] = b"PROXY ";
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
/// Longest legal v1 line, CRLF included
const V1_MAX_LEN: usize = 107;
const V2_HEADER_LEN: usize = 16;

/// Addresses carried by a PROXY preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

/// Result of reading a connection's preamble
#[derive(Debug)]
pub struct Preamble {
    /// Parsed header, if one was present and well formed
    pub header: Option<ProxyHeader>,
    /// Bytes read past the preamble, to be replayed
    pub rest: BytesMut,
}

impl Preamble {
    /// Client address to use for a connection from `peer`
    pub fn client_addr(&self, peer: SocketAddr, trusted: &[IpAddr]) -> SocketAddr {
        match self.header {
            Some(header) if is_trusted(peer.ip(), trusted) => header.source,
            _ => peer,
        }
    }
}

/// An empty trusted list trusts every peer
pub fn is_trusted(peer: IpAddr, trusted: &[IpAddr]) -> bool {
    trusted.is_empty() || trusted.contains(&peer)
}

#[derive(Debug, PartialEq, Eq)]
enum Sniff {
    NeedMore,
    V1,
    V2,
    None,
}

fn sniff(buf: &[u8]) -> Sniff {
    let v1_match = buf.len().min(V1_PREFIX.len());
    let v2_match = buf.len().min(V2_SIGNATURE.len());
    if buf[..v2_match] == V2_SIGNATURE[..v2_match] {
        if v2_match == V2_SIGNATURE.len() {
            Sniff::V2
        } else {
            Sniff::NeedMore
        }
    } else if buf[..v1_match] == V1_PREFIX[..v1_match] {
        if v1_match == V1_PREFIX.len() {
            Sniff::V1
        } else {
            Sniff::NeedMore
        }
    } else {
        Sniff::None
    }
}

/// Read more bytes into `buf`; false on EOF
async fn fill<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut BytesMut) -> io::Result<bool> {
    buf.reserve(512);
    Ok(stream.read_buf(buf).await? > 0)
}

/// Read a PROXY preamble from the start of `stream`
///
/// Reads only as far as needed to tell whether a preamble is present.
pub async fn read_preamble<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Preamble> {
    let mut buf = BytesMut::with_capacity(512);

    let kind = loop {
        if !buf.is_empty() {
            match sniff(&buf) {
                Sniff::NeedMore => {}
                other => break other,
            }
        }
        if !fill(stream, &mut buf).await? {
            break Sniff::None;
        }
    };

    let header = match kind {
        Sniff::V1 => loop {
            if let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
                let line = buf.split_to(end + 2);
                break parse_v1(&line[..end]);
            }
            if buf.len() >= V1_MAX_LEN || !fill(stream, &mut buf).await? {
                debug!("PROXY v1 line too long or truncated");
                break None;
            }
        },
        Sniff::V2 => {
            while buf.len() < V2_HEADER_LEN {
                if !fill(stream, &mut buf).await? {
                    return Ok(Preamble { header: None, rest: buf });
                }
            }
            let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
            while buf.len() < V2_HEADER_LEN + len {
                if !fill(stream, &mut buf).await? {
                    return Ok(Preamble { header: None, rest: buf });
                }
            }
            let block = buf.split_to(V2_HEADER_LEN + len);
            parse_v2(&block)
        }
        Sniff::None | Sniff::NeedMore => None,
    };

    Ok(Preamble { header, rest: buf })
}

/// Parse a v1 line without its CRLF
fn parse_v1(line: &[u8]) -> Option<ProxyHeader> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split(' ');
    if parts.next()? != "PROXY" {
        return None;
    }
    let family = parts.next()?;
    if family == "UNKNOWN" {
        return None;
    }
    let src: IpAddr = parts.next()?.parse().ok()?;
    let dst: IpAddr = parts.next()?.parse().ok()?;
    let src_port: u16 = parts.next()?.parse().ok()?;
    let dst_port: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let family_ok = match family {
        "TCP4" => src.is_ipv4() && dst.is_ipv4(),
        "TCP6" => src.is_ipv6() && dst.is_ipv6(),
        _ => false,
    };
    family_ok.then_some(ProxyHeader {
        source: SocketAddr::new(src, src_port),
        destination: SocketAddr::new(dst, dst_port),
    })
}

/// Parse a complete v2 header plus address block
fn parse_v2(block: &[u8]) -> Option<ProxyHeader> {
    let version_command = block[12];
    if version_command >> 4 != 2 {
        return None;
    }
    // LOCAL: health checks from the balancer itself
    if version_command & 0x0F != 1 {
        return None;
    }
    let family = block[13] >> 4;
    let mut addrs = &block[V2_HEADER_LEN..];
    match family {
        0x1 if addrs.len() >= 12 => {
            let src = Ipv4Addr::from(addrs.get_u32());
            let dst = Ipv4Addr::from(addrs.get_u32());
            let src_port = addrs.get_u16();
            let dst_port = addrs.get_u16();
            Some(ProxyHeader {
                source: SocketAddr::new(src.into(), src_port),
                destination: SocketAddr::new(dst.into(), dst_port),
            })
        }
        0x2 if addrs.len() >= 36 => {
            let src = Ipv6Addr::from(addrs.get_u128());
            let dst = Ipv6Addr::from(addrs.get_u128());
            let src_port = addrs.get_u16();
            let dst_port = addrs.get_u16();
            Some(ProxyHeader {
                source: SocketAddr::new(src.into(), src_port),
                destination: SocketAddr::new(dst.into(), dst_port),
            })
        }
        _ => None,
    }
}
