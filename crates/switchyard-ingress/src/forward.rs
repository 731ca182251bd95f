//! Forwarding headers and header rules
//!
//! Applied to every proxied request in a fixed order: hop-by-hop headers are
//! removed, the forwarding headers are added, then the configured header
//! rules run in order.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::warn;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const FORWARDED: HeaderName = HeaderName::from_static("forwarded");

/// What a header rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    /// Remove every value of the header
    Strip,
    /// Replace the header with `value`
    Set,
    /// Add `value` alongside any existing values
    Append,
}

/// One header rewrite applied before dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub action: HeaderAction,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl HeaderRule {
    /// Check that the name and value are valid header syntax
    pub fn validate(&self) -> Result<(), String> {
        HeaderName::from_bytes(self.name.as_bytes())
            .map_err(|_| format!("invalid header name '{}'", self.name))?;
        if self.action != HeaderAction::Strip {
            HeaderValue::from_str(&self.value)
                .map_err(|_| format!("invalid value for header '{}'", self.name))?;
        }
        Ok(())
    }
}

/// Forwarding configuration shared by every HTTP listener
#[derive(Debug, Clone, Default)]
pub struct ForwardConfig {
    /// Address reported as `by=` in the `Forwarded` header
    pub local_ip: Option<String>,
    /// Header set on requests that reached the proxy over TLS
    pub tls_header: Option<String>,
    pub tls_header_value: Option<String>,
    pub header_rules: Vec<HeaderRule>,
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including those named by `Connection`
///
/// `te: trailers` survives so gRPC keeps working end to end.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    let keep_te_trailers = headers
        .get(header::TE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")));

    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }

    if keep_te_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
}

/// Protocol the client used, as reported by an upstream proxy or `http`
pub fn client_proto(headers: &HeaderMap) -> String {
    headers
        .get(&X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "http".to_string())
}

/// Add `X-Forwarded-For`, `X-Forwarded-Proto`, `X-Real-Ip`, `Forwarded` and
/// the TLS indicator header
pub fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    client_ip: IpAddr,
    config: &ForwardConfig,
) {
    let ip = client_ip.to_string();
    let proto = client_proto(headers);

    let xff = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, ip),
        _ => ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&xff) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(&X_FORWARDED_PROTO)
        && let Ok(value) = HeaderValue::from_str(&proto)
    {
        headers.insert(X_FORWARDED_PROTO, value);
    }

    if !headers.contains_key(&X_REAL_IP)
        && let Ok(value) = HeaderValue::from_str(&ip)
    {
        headers.insert(X_REAL_IP, value);
    }

    let for_param = match client_ip {
        IpAddr::V4(_) => ip.clone(),
        IpAddr::V6(_) => format!("\"[{}]\"", ip),
    };
    let mut forwarded = format!("for={}; proto={}", for_param, proto);
    if let Some(local_ip) = &config.local_ip {
        forwarded.push_str(&format!("; by={}", local_ip));
    }
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.append(FORWARDED, value);
    }

    if proto == "https"
        && let Some(name) = &config.tls_header
        && let Ok(name) = HeaderName::from_bytes(name.as_bytes())
    {
        let value = config.tls_header_value.as_deref().unwrap_or("on");
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

/// Apply header rules in order
pub fn apply_header_rules(headers: &mut HeaderMap, rules: &[HeaderRule]) {
    for rule in rules {
        let Ok(name) = HeaderName::from_bytes(rule.name.as_bytes()) else {
            warn!(header = %rule.name, "skipping header rule with invalid name");
            continue;
        };
        match rule.action {
            HeaderAction::Strip => {
                headers.remove(&name);
            }
            HeaderAction::Set | HeaderAction::Append => {
                let Ok(value) = HeaderValue::from_str(&rule.value) else {
                    warn!(header = %rule.name, "skipping header rule with invalid value");
                    continue;
                };
                if rule.action == HeaderAction::Set {
                    headers.insert(name, value);
                } else {
                    headers.append(name, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("keep-alive"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(is_hop_by_hop_header("Upgrade"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
    }

    #[test]
    fn test_strip_hop_by_hop_honours_connection_list() {
        let mut h = headers(&[
            ("connection", "close, x-secret"),
            ("x-secret", "1"),
            ("keep-alive", "timeout=5"),
            ("content-type", "text/plain"),
        ]);
        strip_hop_by_hop(&mut h);
        assert!(h.get("x-secret").is_none());
        assert!(h.get("connection").is_none());
        assert!(h.get("keep-alive").is_none());
        assert_eq!(h["content-type"], "text/plain");
    }

    #[test]
    fn test_te_trailers_survives() {
        let mut h = headers(&[("te", "trailers")]);
        strip_hop_by_hop(&mut h);
        assert_eq!(h["te"], "trailers");

        let mut h = headers(&[("te", "gzip")]);
        strip_hop_by_hop(&mut h);
        assert!(h.get("te").is_none());
    }

    #[test]
    fn test_forwarding_headers_fresh_request() {
        let mut h = HeaderMap::new();
        apply_forwarding_headers(&mut h, "10.1.2.3".parse().unwrap(), &ForwardConfig::default());
        assert_eq!(h["x-forwarded-for"], "10.1.2.3");
        assert_eq!(h["x-forwarded-proto"], "http");
        assert_eq!(h["x-real-ip"], "10.1.2.3");
        assert_eq!(h["forwarded"], "for=10.1.2.3; proto=http");
    }

    #[test]
    fn test_forwarding_headers_append_to_existing() {
        let mut h = headers(&[
            ("x-forwarded-for", "1.1.1.1"),
            ("x-forwarded-proto", "https"),
            ("x-real-ip", "1.1.1.1"),
        ]);
        let config = ForwardConfig {
            local_ip: Some("192.168.0.1".to_string()),
            tls_header: Some("X-Tls".to_string()),
            tls_header_value: None,
            header_rules: vec![],
        };
        apply_forwarding_headers(&mut h, "::1".parse().unwrap(), &config);
        assert_eq!(h["x-forwarded-for"], "1.1.1.1, ::1");
        assert_eq!(h["x-forwarded-proto"], "https");
        assert_eq!(h["x-real-ip"], "1.1.1.1");
        assert_eq!(h["forwarded"], "for=\"[::1]\"; proto=https; by=192.168.0.1");
        assert_eq!(h["x-tls"], "on");
    }

    #[test]
    fn test_header_rules_in_order() {
        let mut h = headers(&[("x-a", "1"), ("x-b", "2")]);
        let rules = vec![
            HeaderRule {
                action: HeaderAction::Strip,
                name: "x-a".to_string(),
                value: String::new(),
            },
            HeaderRule {
                action: HeaderAction::Set,
                name: "x-b".to_string(),
                value: "3".to_string(),
            },
            HeaderRule {
                action: HeaderAction::Append,
                name: "x-b".to_string(),
                value: "4".to_string(),
            },
        ];
        apply_header_rules(&mut h, &rules);
        assert!(h.get("x-a").is_none());
        let b: Vec<_> = h.get_all("x-b").iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(b, vec!["3", "4"]);
    }

    #[test]
    fn test_header_rule_validation() {
        let bad = HeaderRule {
            action: HeaderAction::Set,
            name: "bad header".to_string(),
            value: "x".to_string(),
        };
        assert!(bad.validate().is_err());

        let rule: HeaderRule =
            serde_json::from_str(r#"{"action":"strip","name":"x-internal"}"#).unwrap();
        assert_eq!(rule.action, HeaderAction::Strip);
        assert!(rule.validate().is_ok());
    }
}
