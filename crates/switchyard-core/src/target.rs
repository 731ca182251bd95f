//! Target destinations and per-target options
//!
//! A destination is an absolute URL whose scheme is one of [`Scheme`].
//! Options are parsed from the `opts "<k=v …>"` clause of `route add`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// Upstream protocol of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Tcp,
    Grpc,
    Grpcs,
    Redirect,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Tcp => "tcp",
            Scheme::Grpc => "grpc",
            Scheme::Grpcs => "grpcs",
            Scheme::Redirect => "redirect",
        }
    }

    /// Whether the upstream connection is TLS
    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Grpcs)
    }

    /// Default port used when the destination omits one
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Https | Scheme::Grpcs | Scheme::Redirect => 443,
            _ => 80,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "tcp" => Ok(Scheme::Tcp),
            "grpc" => Ok(Scheme::Grpc),
            "grpcs" => Ok(Scheme::Grpcs),
            "redirect" => Ok(Scheme::Redirect),
            other => Err(format!("unsupported scheme '{}'", other)),
        }
    }
}

/// Parse a destination URL, accepting only the supported schemes
pub fn parse_destination(raw: &str) -> Result<(Scheme, Url), String> {
    // special schemes let url skip an empty authority, turning the path into the host
    if raw
        .split_once("://")
        .is_some_and(|(_, rest)| rest.is_empty() || rest.starts_with(['/', '?', '#']))
    {
        return Err(format!("destination '{}' has no host", raw));
    }
    let url = Url::parse(raw).map_err(|e| format!("invalid destination '{}': {}", raw, e))?;
    let scheme = url.scheme().parse::<Scheme>()?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(format!("destination '{}' has no host", raw));
    }
    Ok((scheme, url))
}

/// Stable identity of a target, shared by timers and breakers across tables
pub fn target_key(service: &str, dst: &str) -> String {
    format!("{}|{}", service, dst)
}

/// `redirect=<code>[,<url>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectOption {
    pub code: u16,
    pub location: Option<String>,
}

/// Known target options plus any unrecognized `key=value` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOptions {
    /// Overrides the protocol used to talk to the upstream
    pub proto: Option<Scheme>,
    pub tls_skip_verify: bool,
    pub redirect: Option<RedirectOption>,
    /// Path prefix removed from the request before forwarding
    pub strip: Option<String>,
    /// `host=dst` sends the target authority as Host; any other value is sent literally
    pub host: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl TargetOptions {
    pub fn is_empty(&self) -> bool {
        *self == TargetOptions::default()
    }

    /// Parse the body of an `opts "…"` clause
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut opts = TargetOptions::default();
        for token in raw.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match (key, value) {
                ("proto", Some(v)) => {
                    let scheme = v.parse::<Scheme>()?;
                    if matches!(scheme, Scheme::Redirect) {
                        return Err("proto=redirect is not allowed".to_string());
                    }
                    opts.proto = Some(scheme);
                }
                ("tlsskipverify", None) => opts.tls_skip_verify = true,
                ("tlsskipverify", Some(v)) => {
                    opts.tls_skip_verify = v
                        .parse::<bool>()
                        .map_err(|_| format!("tlsskipverify expects true or false, got '{}'", v))?;
                }
                ("redirect", Some(v)) => opts.redirect = Some(parse_redirect(v)?),
                ("strip", Some(v)) => {
                    if !v.starts_with('/') {
                        return Err(format!("strip prefix '{}' must start with '/'", v));
                    }
                    opts.strip = Some(v.to_string());
                }
                ("host", Some(v)) if !v.is_empty() => opts.host = Some(v.to_string()),
                ("proto" | "redirect" | "strip" | "host", _) => {
                    return Err(format!("option '{}' requires a value", key));
                }
                (_, v) => {
                    opts.extra
                        .insert(key.to_string(), v.unwrap_or_default().to_string());
                }
            }
        }
        Ok(opts)
    }
}

fn parse_redirect(raw: &str) -> Result<RedirectOption, String> {
    let (code, location) = match raw.split_once(',') {
        Some((c, l)) => (c, Some(l.to_string())),
        None => (raw, None),
    };
    let code = code
        .parse::<u16>()
        .map_err(|_| format!("redirect code '{}' is not a number", code))?;
    if !(300..=399).contains(&code) {
        return Err(format!("redirect code {} is not a 3xx status", code));
    }
    if let Some(loc) = &location
        && loc.is_empty()
    {
        return Err("redirect location is empty".to_string());
    }
    Ok(RedirectOption { code, location })
}

impl fmt::Display for TargetOptions {
    /// Canonical form: known keys in fixed order, then extras sorted by key
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(host) = &self.host {
            parts.push(format!("host={}", host));
        }
        if let Some(proto) = &self.proto {
            parts.push(format!("proto={}", proto));
        }
        if let Some(redirect) = &self.redirect {
            match &redirect.location {
                Some(loc) => parts.push(format!("redirect={},{}", redirect.code, loc)),
                None => parts.push(format!("redirect={}", redirect.code)),
            }
        }
        if let Some(strip) = &self.strip {
            parts.push(format!("strip={}", strip));
        }
        if self.tls_skip_verify {
            parts.push("tlsskipverify=true".to_string());
        }
        for (k, v) in &self.extra {
            if v.is_empty() {
                parts.push(k.clone());
            } else {
                parts.push(format!("{}={}", k, v));
            }
        }
        f.write_str(&parts.join(" "))
    }
}
