//! Listener configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// What a listener speaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerProto {
    #[default]
    #[serde(rename = "http")]
    Http,
    /// TLS passthrough routed by the ClientHello server name
    #[serde(rename = "tcp+sni")]
    TcpSni,
}

impl std::fmt::Display for ListenerProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerProto::Http => f.write_str("http"),
            ListenerProto::TcpSni => f.write_str("tcp+sni"),
        }
    }
}

/// One listen endpoint
///
/// Timeouts are in milliseconds; 0 disables them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default)]
    pub proto: ListenerProto,

    /// Expect a PROXY protocol preamble on every connection
    #[serde(default)]
    pub proxy_protocol: bool,

    /// Peers allowed to supply a PROXY preamble; empty trusts everyone
    #[serde(default)]
    pub proxy_protocol_trusted: Vec<IpAddr>,

    #[serde(default)]
    pub read_timeout_ms: u64,

    #[serde(default)]
    pub write_timeout_ms: u64,

    #[serde(default)]
    pub idle_timeout_ms: u64,
}

fn default_addr() -> String {
    "0.0.0.0:9999".to_string()
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            proto: ListenerProto::Http,
            proxy_protocol: false,
            proxy_protocol_trusted: Vec::new(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            idle_timeout_ms: 0,
        }
    }
}

impl ListenerConfig {
    pub fn http(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn tcp_sni(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            proto: ListenerProto::TcpSni,
            ..Default::default()
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_tcp_sni_listener() {
        let config: ListenerConfig = serde_json::from_str(
            r#"{"addr":"0.0.0.0:443","proto":"tcp+sni","proxy_protocol":true,"proxy_protocol_trusted":["10.0.0.1"],"idle_timeout_ms":5000}"#,
        )
        .unwrap();
        assert_eq!(config.proto, ListenerProto::TcpSni);
        assert!(config.proxy_protocol);
        assert_eq!(config.proxy_protocol_trusted, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn test_defaults() {
        let config: ListenerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ListenerConfig::default());
        assert_eq!(config.proto.to_string(), "http");
    }
}
