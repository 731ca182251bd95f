//! Raw TCP dialing

use crate::{EgressError, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to `addr` ("host:port"), failing after `timeout`
pub async fn dial_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| EgressError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|source| EgressError::Dial {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true).map_err(|source| EgressError::Dial {
        addr: addr.to_string(),
        source,
    })?;
    Ok(stream)
}
