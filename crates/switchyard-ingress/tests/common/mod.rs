//! Shared helpers for ingress integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_egress::{UpstreamClientConfig, UpstreamClients};
use switchyard_ingress::{Dispatcher, DispatcherConfig, HttpServer, ListenerConfig};
use switchyard_routing::{MatcherKind, Selector, Strategy, Table, TablePublisher};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A running HTTP listener bound to an ephemeral port
#[allow(dead_code)]
pub struct Proxy {
    pub addr: SocketAddr,
    pub dispatcher: Dispatcher,
    pub publisher: Arc<TablePublisher>,
    pub handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl Proxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub fn dispatcher(program: &str, config: DispatcherConfig) -> (Dispatcher, Arc<TablePublisher>) {
    let publisher = Arc::new(TablePublisher::new(None));
    publisher.publish(Table::compile(program, MatcherKind::Prefix).unwrap());
    let clients = UpstreamClients::new(&UpstreamClientConfig {
        dial_timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();
    let dispatcher = Dispatcher::new(
        publisher.clone(),
        Arc::new(Selector::new(Strategy::Rnd)),
        clients,
        config,
    );
    (dispatcher, publisher)
}

pub async fn start_with(
    dispatcher: Dispatcher,
    publisher: Arc<TablePublisher>,
    mut listener_config: ListenerConfig,
) -> Proxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    listener_config.addr = addr.to_string();
    let server = HttpServer::from_listener(
        listener,
        listener_config,
        dispatcher.clone(),
        Duration::from_secs(5),
    );
    let handle = tokio::spawn(server.run());
    Proxy {
        addr,
        dispatcher,
        publisher,
        handle,
    }
}

#[allow(dead_code)]
pub async fn start(program: &str, config: DispatcherConfig) -> Proxy {
    let (dispatcher, publisher) = dispatcher(program, config);
    start_with(dispatcher, publisher, ListenerConfig::http("127.0.0.1:0")).await
}

/// An address nothing listens on
#[allow(dead_code)]
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap()
}
