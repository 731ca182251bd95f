//! Process wiring
//!
//! [`App::build`] turns a validated [`ServerConfig`] into the running parts:
//! registry backend, table publisher, breaker, dispatcher and metrics.
//! [`App::bind`] opens every listener so bind failures surface before anything
//! is served, and [`BoundApp::serve`] runs until the shutdown future resolves,
//! then drains.

use anyhow::{Context, Result};
use axum::Router;
use http::StatusCode;
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use switchyard_core::Registry;
use switchyard_egress::UpstreamClients;
use switchyard_ingress::{
    Dispatcher, DispatcherConfig, Drain, HttpServer, ListenerConfig, ListenerProto, TcpSniServer,
};
use switchyard_observability::{HealthState, Metrics, TimerRegistry, health_router};
use switchyard_registry::{FileRegistry, MemoryRegistry};
use switchyard_routing::{
    BreakerMonitor, RegistryWatcher, Selector, TablePublisher, breaker_channel,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admin::{AdminState, admin_router};
use crate::config::{RegistryBackend, ServerConfig};

/// Everything the server runs, before any socket is opened
pub struct App {
    config: ServerConfig,
    pub publisher: Arc<TablePublisher>,
    pub registry: Arc<dyn Registry>,
    pub dispatcher: Dispatcher,
    pub metrics: Arc<Metrics>,
    pub timers: Arc<TimerRegistry>,
    monitor: BreakerMonitor,
    overlay: watch::Receiver<String>,
}

impl App {
    pub fn build(config: ServerConfig) -> Result<Self> {
        let registry = build_registry(&config)?;
        Self::with_registry(config, registry)
    }

    /// Build around an already constructed registry backend
    pub fn with_registry(config: ServerConfig, registry: Arc<dyn Registry>) -> Result<Self> {
        let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);
        let publisher = Arc::new(TablePublisher::new(Some(metrics.clone())));
        let timers = Arc::new(TimerRegistry::new());

        let (breaker, monitor, overlay) =
            breaker_channel(config.breaker_config(), Some(metrics.clone()));

        let clients = UpstreamClients::new(&config.upstream_client_config())
            .context("Failed to create upstream clients")?;

        let noroute_html = match &config.proxy.noroute_html_path {
            Some(path) => Some(std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read noroute_html_path {}", path.display())
            })?),
            None => None,
        };
        let dispatcher_config = DispatcherConfig {
            noroute_status: StatusCode::from_u16(config.proxy.noroute_status)
                .context("Invalid noroute_status")?,
            noroute_html,
            max_body_bytes: (config.proxy.max_body_bytes > 0).then_some(config.proxy.max_body_bytes),
            breaker_on_5xx: config.proxy.breaker_on_5xx,
            dial_timeout: config.dial_timeout(),
            forward: config.forward_config(),
        };

        let dispatcher = Dispatcher::new(
            publisher.clone(),
            Arc::new(Selector::new(config.proxy.strategy)),
            clients,
            dispatcher_config,
        )
        .with_breaker(breaker)
        .with_timers(timers.clone())
        .with_metrics(metrics.clone())
        .with_drain(Drain::new());

        Ok(Self {
            config,
            publisher,
            registry,
            dispatcher,
            metrics,
            timers,
            monitor,
            overlay,
        })
    }

    /// Open every listener and the admin endpoint
    pub async fn bind(self) -> Result<BoundApp> {
        let shutdown_wait = self.config.shutdown_wait();
        let mut servers = Vec::new();
        for listener in &self.config.listeners {
            servers.push(bind_listener(listener, &self.dispatcher, &self.config).await?);
        }

        let admin = if self.config.admin.enabled {
            let listener = TcpListener::bind(&self.config.admin.addr)
                .await
                .with_context(|| format!("Failed to bind admin listener {}", self.config.admin.addr))?;
            Some(listener)
        } else {
            None
        };

        Ok(BoundApp {
            app: self,
            servers,
            admin,
            shutdown_wait,
        })
    }
}

fn build_registry(config: &ServerConfig) -> Result<Arc<dyn Registry>> {
    let root = config.registry.manual_path.clone();
    match config.registry.backend {
        RegistryBackend::Static => Ok(Arc::new(MemoryRegistry::with_services(
            root,
            config.registry.static_program.clone(),
        ))),
        RegistryBackend::File => {
            let services = config
                .registry
                .services_path
                .clone()
                .context("registry backend 'file' requires services_path")?;
            let manual_dir = config.registry.manual_dir.clone().unwrap_or_else(|| {
                services
                    .parent()
                    .map(|p| p.join("manual.d"))
                    .unwrap_or_else(|| "manual.d".into())
            });
            Ok(Arc::new(FileRegistry::new(services, manual_dir, root)?))
        }
    }
}

enum Server {
    Http(HttpServer),
    TcpSni(TcpSniServer),
}

impl Server {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Server::Http(s) => s.local_addr(),
            Server::TcpSni(s) => s.local_addr(),
        }
    }

    fn spawn(self) -> JoinHandle<()> {
        match self {
            Server::Http(s) => tokio::spawn(s.run()),
            Server::TcpSni(s) => tokio::spawn(s.run()),
        }
    }
}

async fn bind_listener(
    listener: &ListenerConfig,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
) -> Result<Server> {
    let context = || format!("Failed to bind {} listener {}", listener.proto, listener.addr);
    Ok(match listener.proto {
        ListenerProto::Http => Server::Http(
            HttpServer::bind(listener.clone(), dispatcher.clone(), config.shutdown_wait())
                .await
                .with_context(context)?,
        ),
        ListenerProto::TcpSni => Server::TcpSni(
            TcpSniServer::bind(
                listener.clone(),
                dispatcher.clone(),
                config.dial_timeout(),
                config.shutdown_wait(),
            )
            .await
            .with_context(context)?,
        ),
    })
}

/// A built app with its sockets open
pub struct BoundApp {
    app: App,
    servers: Vec<Server>,
    admin: Option<TcpListener>,
    shutdown_wait: std::time::Duration,
}

impl BoundApp {
    /// Addresses of the proxy listeners, in configuration order
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.servers
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn drain(&self) -> Drain {
        self.app.dispatcher.drain().clone()
    }

    pub fn publisher(&self) -> Arc<TablePublisher> {
        self.app.publisher.clone()
    }

    /// Serve until `shutdown` resolves, then drain and wait for the listeners
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let BoundApp {
            app,
            servers,
            admin,
            shutdown_wait,
        } = self;
        let drain = app.dispatcher.drain().clone();

        let monitor = tokio::spawn(app.monitor.run());
        let watcher = RegistryWatcher::new(
            app.registry.clone(),
            app.publisher.clone(),
            app.config.watcher_config(),
        )
        .with_overlay(app.overlay)
        .with_metrics(app.metrics.clone())
        .spawn();
        let pruner = tokio::spawn(prune_stale_state(
            app.publisher.clone(),
            app.timers.clone(),
            app.dispatcher.selector().clone(),
        ));

        let mut handles: Vec<JoinHandle<()>> = servers.into_iter().map(Server::spawn).collect();

        if let Some(listener) = admin {
            let health = HealthState::with_readiness_checker(
                app.metrics.clone(),
                app.publisher.clone(),
            );
            let router: Router = admin_router(AdminState {
                publisher: app.publisher.clone(),
                registry: app.registry.clone(),
                timers: app.timers.clone(),
            })
            .merge(health_router(health));
            let admin_drain = drain.clone();
            info!(addr = ?listener.local_addr().ok(), "admin listener started");
            handles.push(tokio::spawn(async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { admin_drain.started().await })
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "admin listener failed");
                }
            }));
        }

        let signal_drain = drain.clone();
        tokio::spawn(async move {
            shutdown.await;
            signal_drain.start();
        });

        drain.started().await;
        info!(
            wait_ms = shutdown_wait.as_millis() as u64,
            "shutting down, waiting for in-flight requests"
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "listener task failed");
            }
        }

        watcher.abort();
        pruner.abort();
        // the dispatcher holds the last breaker handle
        drop(app.dispatcher);
        monitor.abort();
        info!("shutdown complete");
        Ok(())
    }
}

/// Drop timers of targets that left the table
/// Forget timers and round-robin counters of targets and routes that left the table
async fn prune_stale_state(
    publisher: Arc<TablePublisher>,
    timers: Arc<TimerRegistry>,
    selector: Arc<Selector>,
) {
    let mut generations = publisher.subscribe();
    while generations.changed().await.is_ok() {
        let table = publisher.load();
        let live: HashSet<&str> = table
            .routes()
            .flat_map(|r| r.targets.iter().map(|t| t.key()))
            .collect();
        timers.retain_keys(|key| live.contains(key));
        selector.retain_routes(&table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(program: &str) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.listeners = vec![ListenerConfig::http("127.0.0.1:0")];
        config.admin.addr = "127.0.0.1:0".to_string();
        config.registry.static_program = program.to_string();
        config.proxy.shutdown_wait_ms = 1000;
        config
    }

    #[tokio::test]
    async fn test_build_publishes_static_program() {
        let app = App::build(test_config("route add svc / http://127.0.0.1:1/"))
            .unwrap()
            .bind()
            .await
            .unwrap();
        assert_eq!(app.listener_addrs().len(), 1);
        assert!(app.admin_addr().is_some());

        let publisher = app.publisher();
        let drain = app.drain();
        let serving = tokio::spawn(app.serve(std::future::pending()));

        let mut generations = publisher.subscribe();
        tokio::time::timeout(Duration::from_secs(5), generations.wait_for(|g| *g > 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(publisher.load().len(), 1);

        drain.start();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config("");
        config.listeners = vec![ListenerConfig::http(taken.local_addr().unwrap().to_string())];
        let err = App::build(config).unwrap().bind().await.err().unwrap();
        assert!(err.to_string().contains("Failed to bind http listener"));
    }

    #[tokio::test]
    async fn test_missing_noroute_html_is_fatal() {
        let mut config = test_config("");
        config.proxy.noroute_html_path = Some("/nonexistent/noroute.html".into());
        assert!(App::build(config).is_err());
    }

    #[tokio::test]
    async fn test_pruning_follows_table() {
        use switchyard_routing::{MatcherKind, Strategy, Table};

        let publisher = Arc::new(TablePublisher::new(None));
        let timers = Arc::new(TimerRegistry::new());
        let selector = Arc::new(Selector::new(Strategy::RoundRobin));
        timers.timer("gone|http://old/");
        let old = Table::compile("route add gone /old http://old/", MatcherKind::Prefix).unwrap();
        selector.select(old.lookup("", "/old").unwrap(), |_| false);
        assert_eq!(selector.tracked_routes(), 1);

        tokio::spawn(prune_stale_state(
            publisher.clone(),
            timers.clone(),
            selector.clone(),
        ));
        tokio::task::yield_now().await;

        publisher.publish(Table::compile("route add s / http://new/", MatcherKind::Prefix).unwrap());
        tokio::time::timeout(Duration::from_secs(2), async {
            while timers.get("gone|http://old/").is_some() || selector.tracked_routes() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
