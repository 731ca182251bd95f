//! Switchyard Egress
//!
//! Connections from the proxy to its upstream targets:
//! - pooled HTTP clients, one per transport flavour (verified TLS,
//!   unverified TLS, cleartext HTTP/2)
//! - raw TCP dialing with a connect deadline

pub mod client;
pub mod dial;

pub use client::{ClientFlavor, UpstreamClientConfig, UpstreamClients, create_client};
pub use dial::dial_tcp;

/// Egress error
#[derive(Debug, thiserror::Error)]
pub enum EgressError {
    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out {0}")]
    Timeout(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EgressError {
    /// True when the upstream could not be reached at all
    pub fn is_connect(&self) -> bool {
        match self {
            EgressError::Dial { .. } => true,
            EgressError::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            EgressError::Timeout(_) => true,
            EgressError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EgressError>;
