//! HTTP listener
//!
//! Accepts connections, optionally reads a PROXY preamble, and serves
//! HTTP/1.1 (with upgrades) and HTTP/2 through the [`Dispatcher`].
//!
//! On drain the listener stops accepting, asks every open connection to
//! finish its in-flight requests and close, and waits up to the configured
//! shutdown wait for them to do so.

use axum::body::Body;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::pin;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::io::{DeadlineIo, Rewind};
use crate::listener::ListenerConfig;
use crate::proxy_protocol;
use crate::shutdown::{ConnectionGuard, ConnectionTracker};

/// Delay after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct HttpServer {
    listener: TcpListener,
    config: ListenerConfig,
    dispatcher: Dispatcher,
    shutdown_wait: Duration,
}

impl HttpServer {
    /// Bind `config.addr`
    pub async fn bind(
        config: ListenerConfig,
        dispatcher: Dispatcher,
        shutdown_wait: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(Self::from_listener(listener, config, dispatcher, shutdown_wait))
    }

    pub fn from_listener(
        listener: TcpListener,
        config: ListenerConfig,
        dispatcher: Dispatcher,
        shutdown_wait: Duration,
    ) -> Self {
        Self {
            listener,
            config,
            dispatcher,
            shutdown_wait,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the dispatcher's drain starts, then wait for open connections
    pub async fn run(self) {
        let addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.addr.clone());
        info!(addr = %addr, proxy_protocol = self.config.proxy_protocol, "HTTP listener started");

        let connections = ConnectionTracker::new();
        let drain = self.dispatcher.drain().clone();

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(addr = %addr, error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                _ = drain.started() => break,
            };

            let dispatcher = self.dispatcher.clone();
            let config = self.config.clone();
            let guard = connections.guard();
            tokio::spawn(async move {
                serve_connection(stream, peer, config, dispatcher, guard).await;
            });
        }

        drop(self.listener);
        let open = connections.open();
        info!(addr = %addr, open, "HTTP listener closed, waiting for connections");
        if !connections.wait(self.shutdown_wait).await {
            warn!(addr = %addr, "shutdown wait elapsed with connections still open");
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: ListenerConfig,
    dispatcher: Dispatcher,
    guard: ConnectionGuard,
) {
    let _ = stream.set_nodelay(true);

    let (client_addr, prefix) = if config.proxy_protocol {
        let read = proxy_protocol::read_preamble(&mut stream);
        let preamble = match config.read_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(peer = %peer, "timed out reading PROXY preamble");
                    return;
                }
            },
            None => read.await,
        };
        match preamble {
            Ok(preamble) => (
                preamble.client_addr(peer, &config.proxy_protocol_trusted),
                preamble.rest.freeze(),
            ),
            Err(e) => {
                debug!(peer = %peer, error = %e, "failed to read PROXY preamble");
                return;
            }
        }
    } else {
        (peer, bytes::Bytes::new())
    };

    let io = DeadlineIo::new(
        Rewind::new(prefix, stream),
        config.idle_timeout(),
        config.write_timeout(),
    );

    let drain = dispatcher.drain().clone();
    let request_guard = guard.clone();
    let service = service_fn(move |mut req: hyper::Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        // upgraded connections outlive this exchange and carry the guard along
        req.extensions_mut().insert(request_guard.clone());
        async move {
            let response = dispatcher.handle(req.map(Body::new), client_addr).await;
            Ok::<_, Infallible>(response)
        }
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder.http1().timer(TokioTimer::new());
    if let Some(timeout) = config.read_timeout() {
        builder.http1().header_read_timeout(timeout);
    }

    let mut conn = pin!(builder.serve_connection_with_upgrades(TokioIo::new(io), service));
    let mut draining = pin!(drain.started());
    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "connection error");
                }
                break;
            }
            _ = draining.as_mut(), if !closing => {
                conn.as_mut().graceful_shutdown();
                closing = true;
            }
        }
    }
    drop(guard);
}
