//! Server configuration
//!
//! Loaded from YAML (or TOML, by file extension), then overridden by
//! `SWITCHYARD_*` environment variables, then by command line flags. Every
//! field has a default, so an empty file is a valid configuration.

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_egress::UpstreamClientConfig;
use switchyard_ingress::{ForwardConfig, HeaderRule, ListenerConfig};
use switchyard_observability::LoggingConfig;
use switchyard_routing::{CircuitBreakerConfig, MatcherKind, Strategy, WatcherConfig};

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub matcher: MatcherKind,

    #[serde(default = "default_noroute_status")]
    pub noroute_status: u16,

    /// File whose contents are served with `noroute_status`
    #[serde(default)]
    pub noroute_html_path: Option<PathBuf>,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// 0 waits for upstream response headers indefinitely
    #[serde(default)]
    pub response_header_timeout_ms: u64,

    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,

    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// 0 accepts any request body size
    #[serde(default)]
    pub max_body_bytes: usize,

    #[serde(default = "default_shutdown_wait_ms")]
    pub shutdown_wait_ms: u64,

    #[serde(default)]
    pub breaker_on_5xx: bool,

    /// Reported as `by=` in `Forwarded`
    #[serde(default)]
    pub local_ip: Option<String>,

    #[serde(default)]
    pub tls_header: Option<String>,

    #[serde(default)]
    pub tls_header_value: Option<String>,

    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// A fixed services program from `static_program`
    #[default]
    Static,
    /// A services file and a manual override directory
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,

    #[serde(default)]
    pub static_program: String,

    #[serde(default)]
    pub services_path: Option<PathBuf>,

    #[serde(default)]
    pub manual_dir: Option<PathBuf>,

    /// Name of the default manual entry
    #[serde(default = "default_manual_path")]
    pub manual_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_admin_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: default_listeners(),
            proxy: ProxyConfig::default(),
            registry: RegistryConfig::default(),
            watcher: WatcherSettings::default(),
            breaker: BreakerSettings::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            matcher: MatcherKind::default(),
            noroute_status: default_noroute_status(),
            noroute_html_path: None,
            dial_timeout_ms: default_dial_timeout_ms(),
            response_header_timeout_ms: 0,
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            max_idle_per_host: default_max_idle_per_host(),
            max_body_bytes: 0,
            shutdown_wait_ms: default_shutdown_wait_ms(),
            breaker_on_5xx: false,
            local_ip: None,
            tls_header: None,
            tls_header_value: None,
            header_rules: Vec::new(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            static_program: String::new(),
            services_path: None,
            manual_dir: None,
            manual_path: default_manual_path(),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            tick_ms: default_tick_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_admin_addr(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            Self::from_toml(&contents)
        } else {
            // Default to YAML
            Self::from_yaml(&contents)
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        // serde_yaml reads an empty document as null
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        self.merge_vars(|name| std::env::var(name).ok());
    }

    /// Merge `SWITCHYARD_*` values supplied by `lookup`
    pub fn merge_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("SWITCHYARD_LISTEN") {
            self.set_listen(&addr);
        }

        if let Some(val) = lookup("SWITCHYARD_STRATEGY") {
            match val.parse() {
                Ok(strategy) => self.proxy.strategy = strategy,
                Err(_) => tracing::warn!("Invalid SWITCHYARD_STRATEGY '{}', ignoring", val),
            }
        }

        if let Some(val) = lookup("SWITCHYARD_MATCHER") {
            match val.to_lowercase().as_str() {
                "prefix" => self.proxy.matcher = MatcherKind::Prefix,
                "glob" => self.proxy.matcher = MatcherKind::Glob,
                _ => tracing::warn!("Invalid SWITCHYARD_MATCHER '{}', ignoring", val),
            }
        }

        if let Some(val) = lookup("SWITCHYARD_NOROUTE_STATUS")
            && let Ok(status) = val.parse::<u16>()
        {
            self.proxy.noroute_status = status;
        }

        if let Some(val) = lookup("SWITCHYARD_SHUTDOWN_WAIT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.proxy.shutdown_wait_ms = ms;
        }

        if let Some(path) = lookup("SWITCHYARD_SERVICES_PATH") {
            self.registry.backend = RegistryBackend::File;
            self.registry.services_path = Some(PathBuf::from(path));
        }

        if let Some(dir) = lookup("SWITCHYARD_MANUAL_DIR") {
            self.registry.manual_dir = Some(PathBuf::from(dir));
        }

        if let Some(addr) = lookup("SWITCHYARD_ADMIN_ADDR") {
            self.admin.addr = addr;
        }

        if let Some(level) = lookup("SWITCHYARD_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(val) = lookup("SWITCHYARD_LOG_JSON")
            && let Ok(json) = val.parse::<bool>()
        {
            self.logging.json = json;
        }
    }

    /// Replace the address of the first HTTP listener, adding one if none exists
    pub fn set_listen(&mut self, addr: &str) {
        match self
            .listeners
            .iter_mut()
            .find(|l| l.proto == switchyard_ingress::ListenerProto::Http)
        {
            Some(listener) => listener.addr = addr.to_string(),
            None => self.listeners.push(ListenerConfig::http(addr)),
        }
    }

    /// Check everything that would otherwise fail at start-up
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid("no listeners configured".to_string()));
        }
        for listener in &self.listeners {
            listener.addr.parse::<SocketAddr>().map_err(|_| {
                ConfigError::Invalid(format!("invalid listener address '{}'", listener.addr))
            })?;
        }

        StatusCode::from_u16(self.proxy.noroute_status).map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid noroute_status {}",
                self.proxy.noroute_status
            ))
        })?;

        for rule in &self.proxy.header_rules {
            rule.validate().map_err(ConfigError::Invalid)?;
        }

        if let Some(ip) = &self.proxy.local_ip {
            ip.parse::<IpAddr>()
                .map_err(|_| ConfigError::Invalid(format!("invalid local_ip '{}'", ip)))?;
        }

        if self.registry.backend == RegistryBackend::File && self.registry.services_path.is_none()
        {
            return Err(ConfigError::Invalid(
                "registry backend 'file' requires services_path".to_string(),
            ));
        }

        if self.admin.enabled {
            self.admin.addr.parse::<SocketAddr>().map_err(|_| {
                ConfigError::Invalid(format!("invalid admin address '{}'", self.admin.addr))
            })?;
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "breaker tick_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.proxy.shutdown_wait_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.dial_timeout_ms)
    }

    pub fn upstream_client_config(&self) -> UpstreamClientConfig {
        UpstreamClientConfig {
            dial_timeout: self.dial_timeout(),
            response_header_timeout: (self.proxy.response_header_timeout_ms > 0)
                .then(|| Duration::from_millis(self.proxy.response_header_timeout_ms)),
            keepalive_timeout: Duration::from_millis(self.proxy.keepalive_timeout_ms),
            max_idle_per_host: self.proxy.max_idle_per_host,
            local_address: None,
        }
    }

    pub fn forward_config(&self) -> ForwardConfig {
        ForwardConfig {
            local_ip: self.proxy.local_ip.clone(),
            tls_header: self.proxy.tls_header.clone(),
            tls_header_value: self.proxy.tls_header_value.clone(),
            header_rules: self.proxy.header_rules.clone(),
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(self.watcher.debounce_ms),
            max_backoff: Duration::from_millis(self.watcher.max_backoff_ms),
            matcher: self.proxy.matcher,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_millis(self.breaker.cooldown_ms),
            tick: Duration::from_millis(self.breaker.tick_ms),
            channel_capacity: self.breaker.channel_capacity,
        }
    }
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig::default()]
}

fn default_noroute_status() -> u16 {
    404
}

fn default_dial_timeout_ms() -> u64 {
    30_000
}

fn default_keepalive_timeout_ms() -> u64 {
    90_000
}

fn default_max_idle_per_host() -> usize {
    32
}

fn default_shutdown_wait_ms() -> u64 {
    10_000
}

fn default_manual_path() -> String {
    "manual".to_string()
}

fn default_debounce_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_tick_ms() -> u64 {
    15_000
}

fn default_channel_capacity() -> usize {
    100
}

fn default_admin_addr() -> String {
    "127.0.0.1:9998".to_string()
}

fn default_true() -> bool {
    true
}
