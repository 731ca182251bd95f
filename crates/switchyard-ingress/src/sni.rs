//! TLS ClientHello sniffing
//!
//! Reads the first TLS handshake message off a connection and extracts the
//! `server_name` extension. The bytes read are returned so they can be
//! replayed to the upstream unchanged.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;
/// Upper bound for a ClientHello spread over several records
const MAX_HELLO_LEN: usize = 64 * 1024;

/// Bytes consumed while sniffing plus the server name, if any
#[derive(Debug)]
pub struct ClientHello {
    pub buffered: BytesMut,
    pub server_name: Option<String>,
}

/// Read a ClientHello from `stream`, starting with any `prefix` already read
///
/// Returns `server_name: None` for anything that is not a TLS handshake or
/// carries no SNI; the consumed bytes are still returned.
pub async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    prefix: BytesMut,
) -> io::Result<ClientHello> {
    let mut buffered = prefix;
    let mut handshake: Vec<u8> = Vec::new();
    let mut offset = 0;

    loop {
        if !fill_to(stream, &mut buffered, offset + RECORD_HEADER_LEN).await? {
            break;
        }
        let header = &buffered[offset..offset + RECORD_HEADER_LEN];
        if header[0] != CONTENT_TYPE_HANDSHAKE || header[1] != 0x03 {
            break;
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let record_end = offset + RECORD_HEADER_LEN + record_len;
        if record_end > MAX_HELLO_LEN || !fill_to(stream, &mut buffered, record_end).await? {
            break;
        }
        handshake.extend_from_slice(&buffered[offset + RECORD_HEADER_LEN..record_end]);
        offset = record_end;

        if handshake.len() >= 4 {
            let msg_len =
                u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
            if handshake.len() >= 4 + msg_len || msg_len > MAX_HELLO_LEN {
                break;
            }
        }
    }

    let server_name = parse_server_name(&handshake);
    Ok(ClientHello {
        buffered,
        server_name,
    })
}

/// Read until `buf` holds at least `len` bytes; false on EOF
async fn fill_to<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
    len: usize,
) -> io::Result<bool> {
    while buf.len() < len {
        buf.reserve(len - buf.len());
        if stream.read_buf(buf).await? == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Small cursor over a byte slice; every read is bounds checked
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.data.split_first()?;
        self.data = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        let bytes = self.take(3)?;
        Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let n = self.u8()? as usize;
        self.take(n)
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()? as usize;
        self.take(n)
    }
}

/// Extract the SNI host name from a handshake message
pub fn parse_server_name(handshake: &[u8]) -> Option<String> {
    let mut r = Reader { data: handshake };
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = r.u24()?;
    let mut hello = Reader { data: r.take(len)? };

    hello.take(2)?; // legacy_version
    hello.take(32)?; // random
    hello.vec8()?; // session id
    hello.vec16()?; // cipher suites
    hello.vec8()?; // compression methods
    let mut extensions = Reader {
        data: hello.vec16()?,
    };

    while !extensions.data.is_empty() {
        let kind = extensions.u16()?;
        let body = extensions.vec16()?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut list = Reader {
            data: Reader { data: body }.vec16()?,
        };
        while !list.data.is_empty() {
            let name_type = list.u8()?;
            let name = list.vec16()?;
            if name_type == NAME_TYPE_HOST_NAME {
                let name = std::str::from_utf8(name).ok()?;
                return Some(name.trim_end_matches('.').to_ascii_lowercase());
            }
        }
    }
    None
}

/// Build a minimal ClientHello record for `server_name`
#[cfg(any(test, feature = "test-util"))]
pub fn client_hello_record(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(NAME_TYPE_HOST_NAME);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    // an unrelated extension first: supported_groups
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);
    extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]);
    hello.extend_from_slice(&[0x42; 32]);
    hello.push(0);
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
