//! WebSocket relay
//!
//! An upgrade request is not sent through the pooled clients. The relay
//! dials the target directly, writes the handshake request, and reads the
//! upstream's response head. On `101 Switching Protocols` the client
//! connection is taken over from the HTTP server and bytes are copied in
//! both directions until either side closes.

use axum::body::Body;
use axum::response::Response;
use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use switchyard_egress::dial_tcp;
use switchyard_routing::Target;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::dispatch::DispatchError;
use crate::shutdown::ConnectionGuard;

/// Largest accepted upstream response head
const MAX_HEAD_LEN: usize = 64 * 1024;
/// Deadline for the upstream's handshake response
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// True for `Upgrade: websocket` requests
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim().eq_ignore_ascii_case("websocket"))
}

/// Relay a WebSocket handshake to `target` and splice the connections
pub async fn relay(
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    target: &Target,
    dial_timeout: Duration,
    on_upgrade: OnUpgrade,
    guard: Option<ConnectionGuard>,
) -> Result<Response, DispatchError> {
    let dst = target.dst().to_string();
    if target.upstream_scheme().is_tls() {
        return Err(DispatchError::UpstreamResponse {
            dst,
            message: "websocket upgrades to TLS upstreams are not supported".to_string(),
        });
    }

    let mut upstream = dial_tcp(&target.authority(), dial_timeout)
        .await
        .map_err(|e| {
            if e.is_timeout() {
                DispatchError::UpstreamTimeout { dst: dst.clone() }
            } else {
                DispatchError::UpstreamDial {
                    dst: dst.clone(),
                    message: e.to_string(),
                }
            }
        })?;

    let upstream_err = |message: String| DispatchError::UpstreamResponse {
        dst: dst.clone(),
        message,
    };

    upstream
        .write_all(&encode_request_head(method, path_and_query, headers))
        .await
        .map_err(|e| upstream_err(e.to_string()))?;

    let (head, rest) = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_response_head(&mut upstream))
        .await
        .map_err(|_| DispatchError::UpstreamTimeout { dst: dst.clone() })?
        .map_err(|e| upstream_err(e.to_string()))?;
    let (status, response_headers) = parse_response_head(&head).map_err(upstream_err)?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(dst = %dst, status = status.as_u16(), "websocket upgrade refused upstream");
        let body = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_refusal_body(&mut upstream, &response_headers, rest),
        )
        .await
        .map_err(|_| DispatchError::UpstreamTimeout { dst: dst.clone() })?
        .map_err(|e| upstream_err(e.to_string()))?;

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            if name != header::CONTENT_LENGTH && name != header::TRANSFER_ENCODING {
                builder = builder.header(name, value);
            }
        }
        return builder
            .body(Body::from(body.freeze()))
            .map_err(|e| upstream_err(e.to_string()));
    }

    let mut builder = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        builder = builder.header(name, value);
    }

    let response = builder
        .body(Body::empty())
        .map_err(|e| upstream_err(e.to_string()))?;

    let log_dst = dst.clone();
    tokio::spawn(async move {
        let client = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(dst = %log_dst, error = %e, "client upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        if !rest.is_empty() && client.write_all(&rest).await.is_err() {
            return;
        }
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                debug!(dst = %log_dst, sent, received, "websocket closed");
            }
            Err(e) => debug!(dst = %log_dst, error = %e, "websocket ended"),
        }
        drop(guard);
    });

    Ok(response)
}

fn encode_request_head(method: &Method, path_and_query: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", method, path_and_query).into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Read up to the blank line; returns the head and any bytes after it
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(BytesMut, BytesMut)> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut scanned: usize = 0;
    loop {
        if let Some(pos) = buf[scanned.saturating_sub(3)..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            let end = scanned.saturating_sub(3) + pos + 4;
            let head = buf.split_to(end);
            return Ok((head, buf));
        }
        scanned = buf.len();
        if buf.len() >= MAX_HEAD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream response head too large",
            ));
        }
        buf.reserve(4096);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed during handshake",
            ));
        }
    }
}

/// Body of a refused upgrade, read up to its `Content-Length`
///
/// Bodies without a length are dropped.
async fn read_refusal_body(
    stream: &mut TcpStream,
    headers: &HeaderMap,
    mut rest: BytesMut,
) -> std::io::Result<BytesMut> {
    let Some(len) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        return Ok(BytesMut::new());
    };
    if len > MAX_HEAD_LEN {
        return Ok(BytesMut::new());
    }
    while rest.len() < len {
        rest.reserve(len - rest.len());
        if stream.read_buf(&mut rest).await? == 0 {
            break;
        }
    }
    rest.truncate(len);
    Ok(rest)
}

fn parse_response_head(head: &[u8]) -> Result<(StatusCode, HeaderMap), String> {
    let text = std::str::from_utf8(head).map_err(|_| "response head is not UTF-8".to_string())?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(format!("malformed status line '{}'", status_line));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| format!("malformed status line '{}'", status_line))?;

    let mut headers = HeaderMap::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("malformed header line '{}'", line))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| format!("invalid header name '{}'", name))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| format!("invalid value for header '{}'", name))?;
        headers.append(name, value);
    }
    Ok((status, headers))
}
