//! Upstream HTTP clients

use crate::{EgressError, Result};
use reqwest::{Client, ClientBuilder, Request, Response};
use std::time::Duration;
use switchyard_core::Scheme;
use tracing::debug;

/// Upstream client configuration
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    /// TCP connect deadline
    pub dial_timeout: Duration,

    /// Deadline for the upstream response headers; `None` waits forever.
    /// The body is streamed without a deadline.
    pub response_header_timeout: Option<Duration>,

    /// Idle pooled connections are closed after this long
    pub keepalive_timeout: Duration,

    /// Maximum number of idle connections per upstream host
    pub max_idle_per_host: usize,

    /// Source address for upstream connections
    pub local_address: Option<std::net::IpAddr>,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            response_header_timeout: None,
            keepalive_timeout: Duration::from_secs(90),
            max_idle_per_host: 32,
            local_address: None,
        }
    }
}

/// Transport flavour of a pooled client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFlavor {
    /// HTTP/1.1 or ALPN-negotiated HTTP/2, certificates verified
    Verified,
    /// Like `Verified` but accepts any certificate
    Insecure,
    /// Cleartext HTTP/2 with prior knowledge, for `grpc` targets
    H2c,
}

/// Create a configured HTTP client for one transport flavour
///
/// Clients never follow redirects and never decode bodies; upstream
/// responses are handed to the caller as they arrived.
pub fn create_client(config: &UpstreamClientConfig, flavor: ClientFlavor) -> Result<Client> {
    let mut builder = ClientBuilder::new()
        .connect_timeout(config.dial_timeout)
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.keepalive_timeout)
        .tcp_keepalive(Duration::from_secs(60))
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .local_address(config.local_address);

    builder = match flavor {
        ClientFlavor::Verified => builder,
        ClientFlavor::Insecure => builder.danger_accept_invalid_certs(true),
        ClientFlavor::H2c => builder.http2_prior_knowledge(),
    };

    builder
        .build()
        .map_err(|e| EgressError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// The pooled clients shared by every HTTP listener
#[derive(Debug, Clone)]
pub struct UpstreamClients {
    verified: Client,
    insecure: Client,
    h2c: Client,
    response_header_timeout: Option<Duration>,
}

impl UpstreamClients {
    pub fn new(config: &UpstreamClientConfig) -> Result<Self> {
        Ok(Self {
            verified: create_client(config, ClientFlavor::Verified)?,
            insecure: create_client(config, ClientFlavor::Insecure)?,
            h2c: create_client(config, ClientFlavor::H2c)?,
            response_header_timeout: config.response_header_timeout,
        })
    }

    /// Which flavour serves an upstream of `scheme`
    pub fn flavor(scheme: Scheme, tls_skip_verify: bool) -> ClientFlavor {
        match scheme {
            Scheme::Grpc => ClientFlavor::H2c,
            _ if scheme.is_tls() && tls_skip_verify => ClientFlavor::Insecure,
            _ => ClientFlavor::Verified,
        }
    }

    pub fn client(&self, flavor: ClientFlavor) -> &Client {
        match flavor {
            ClientFlavor::Verified => &self.verified,
            ClientFlavor::Insecure => &self.insecure,
            ClientFlavor::H2c => &self.h2c,
        }
    }

    /// Send `request` and wait for the response headers
    ///
    /// # Errors
    /// - `EgressError::Timeout` if the headers did not arrive within the
    ///   response header deadline
    /// - `EgressError::Http` for connect and protocol failures
    pub async fn send(&self, flavor: ClientFlavor, request: Request) -> Result<Response> {
        let url = request.url().to_string();
        let pending = self.client(flavor).execute(request);
        let response = match self.response_header_timeout {
            Some(deadline) => tokio::time::timeout(deadline, pending)
                .await
                .map_err(|_| {
                    EgressError::Timeout(format!(
                        "waiting {}ms for response headers from {}",
                        deadline.as_millis(),
                        url
                    ))
                })??,
            None => pending.await?,
        };
        debug!(url = %url, status = response.status().as_u16(), "upstream responded");
        Ok(response)
    }
}
