//! End-to-end harness for Switchyard
//!
//! Wires a memory registry, the registry watcher, the breaker monitor and a
//! dispatcher behind real listeners on ephemeral ports, the same way the
//! server does, so scenarios can drive the proxy over sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_egress::{UpstreamClientConfig, UpstreamClients};
use switchyard_ingress::{
    Dispatcher, DispatcherConfig, HttpServer, ListenerConfig, ListenerProto, TcpSniServer,
};
use switchyard_observability::Metrics;
use switchyard_registry::MemoryRegistry;
use switchyard_routing::{
    CircuitBreakerConfig, RegistryWatcher, Selector, Strategy, TablePublisher, WatcherConfig,
    breaker_channel,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Harness settings
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub listener: ListenerConfig,
    pub strategy: Strategy,
    pub breaker: CircuitBreakerConfig,
    pub dispatcher: DispatcherConfig,
    pub dial_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::http("127.0.0.1:0"),
            strategy: Strategy::Rnd,
            breaker: CircuitBreakerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            dial_timeout: Duration::from_secs(2),
        }
    }
}

/// A proxy running against an in-memory registry
pub struct Harness {
    pub addr: SocketAddr,
    pub registry: Arc<MemoryRegistry>,
    pub publisher: Arc<TablePublisher>,
    pub dispatcher: Dispatcher,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    /// Start with `program` as the services program and wait for it to be published
    pub async fn start(program: &str, config: HarnessConfig) -> Self {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let registry = Arc::new(MemoryRegistry::with_services("manual", program));
        let publisher = Arc::new(TablePublisher::new(Some(metrics.clone())));
        let (breaker, monitor, overlay) = breaker_channel(config.breaker, Some(metrics.clone()));

        let clients = UpstreamClients::new(&UpstreamClientConfig {
            dial_timeout: config.dial_timeout,
            ..Default::default()
        })
        .expect("clients");
        let dispatcher = Dispatcher::new(
            publisher.clone(),
            Arc::new(Selector::new(config.strategy)),
            clients,
            config.dispatcher,
        )
        .with_breaker(breaker)
        .with_metrics(metrics.clone());

        let mut tasks = vec![tokio::spawn(monitor.run())];
        tasks.push(
            RegistryWatcher::new(registry.clone(), publisher.clone(), WatcherConfig::default())
                .with_overlay(overlay)
                .with_metrics(metrics)
                .spawn(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let mut listener_config = config.listener;
        listener_config.addr = addr.to_string();
        let shutdown_wait = Duration::from_secs(2);
        tasks.push(match listener_config.proto {
            ListenerProto::Http => tokio::spawn(
                HttpServer::from_listener(listener, listener_config, dispatcher.clone(), shutdown_wait)
                    .run(),
            ),
            ListenerProto::TcpSni => tokio::spawn(
                TcpSniServer::from_listener(
                    listener,
                    listener_config,
                    dispatcher.clone(),
                    config.dial_timeout,
                    shutdown_wait,
                )
                .run(),
            ),
        });

        let harness = Self {
            addr,
            registry,
            publisher,
            dispatcher,
            tasks,
        };
        if !program.trim().is_empty() {
            harness.wait_for_routes().await;
        }
        harness
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until a table with at least one route is active
    pub async fn wait_for_routes(&self) {
        let mut generations = self.publisher.subscribe();
        let publisher = self.publisher.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            generations.wait_for(|_| !publisher.load().is_empty()),
        )
        .await
        .expect("no table published")
        .expect("publisher closed");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// HTTP client that neither follows redirects nor uses a proxy
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .pool_max_idle_per_host(128)
        .build()
        .expect("client")
}

/// An address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr")
}
