//! TCP+SNI listener
//!
//! Routes TLS connections without terminating them. The ClientHello's server
//! name is looked up as `(name, "/")`; the connection is then spliced to the
//! selected target with the already-read bytes replayed first.
//!
//! The splice ends when either side closes, when a write stalls past the
//! write timeout, or when neither side has sent anything for the idle
//! timeout. Both connections are closed together.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_egress::dial_tcp;
use switchyard_observability::Metrics;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::listener::ListenerConfig;
use crate::shutdown::ConnectionTracker;
use crate::{proxy_protocol, sni};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const SPLICE_BUFFER: usize = 16 * 1024;
/// Deadline for the ClientHello when the listener has no read timeout
const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpSniServer {
    listener: TcpListener,
    config: ListenerConfig,
    dispatcher: Dispatcher,
    dial_timeout: Duration,
    shutdown_wait: Duration,
}

impl TcpSniServer {
    pub async fn bind(
        config: ListenerConfig,
        dispatcher: Dispatcher,
        dial_timeout: Duration,
        shutdown_wait: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(Self::from_listener(
            listener,
            config,
            dispatcher,
            dial_timeout,
            shutdown_wait,
        ))
    }

    pub fn from_listener(
        listener: TcpListener,
        config: ListenerConfig,
        dispatcher: Dispatcher,
        dial_timeout: Duration,
        shutdown_wait: Duration,
    ) -> Self {
        Self {
            listener,
            config,
            dispatcher,
            dial_timeout,
            shutdown_wait,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until drain starts, then give open splices the shutdown wait
    pub async fn run(self) {
        let addr = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.addr.clone());
        info!(addr = %addr, "TCP+SNI listener started");

        let connections = ConnectionTracker::new();
        let drain = self.dispatcher.drain().clone();
        let handler = Arc::new(ConnectionHandler {
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
            dial_timeout: self.dial_timeout,
        });

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

            let handler = handler.clone();
            let guard = connections.guard();
            tokio::spawn(async move {
                handler.handle(stream, peer).await;
                drop(guard);
            });
        }

        drop(self.listener);
        info!(addr = %addr, open = connections.open(), "TCP+SNI listener closed");
        if !connections.wait(self.shutdown_wait).await {
            warn!(addr = %addr, "shutdown wait elapsed with connections still open");
        }
    }
}

struct ConnectionHandler {
    config: ListenerConfig,
    dispatcher: Dispatcher,
    dial_timeout: Duration,
}

impl ConnectionHandler {
    fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.dispatcher.metrics()
    }

    fn outcome(&self, outcome: &str) {
        if let Some(metrics) = self.metrics() {
            metrics.record_tcp_connection(outcome);
        }
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr) {
        let _ = client.set_nodelay(true);
        let hello_timeout = self.config.read_timeout().unwrap_or(DEFAULT_HELLO_TIMEOUT);

        let sniffed = tokio::time::timeout(hello_timeout, async {
            let (client_addr, prefix) = if self.config.proxy_protocol {
                let preamble = proxy_protocol::read_preamble(&mut client).await?;
                (
                    preamble.client_addr(peer, &self.config.proxy_protocol_trusted),
                    preamble.rest,
                )
            } else {
                (peer, BytesMut::new())
            };
            let hello = sni::read_client_hello(&mut client, prefix).await?;
            Ok::<_, std::io::Error>((client_addr, hello))
        })
        .await;

        let (client_addr, hello) = match sniffed {
            Ok(Ok(sniffed)) => sniffed,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "failed to read ClientHello");
                self.outcome("bad_hello");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "timed out reading ClientHello");
                self.outcome("bad_hello");
                return;
            }
        };

        let Some(server_name) = hello.server_name else {
            debug!(client = %client_addr, "ClientHello without server name");
            self.outcome("bad_hello");
            return;
        };

        if self.dispatcher.drain().is_draining() {
            self.outcome("draining");
            return;
        }

        let Some(target) = self.dispatcher.select_target(&server_name, "/") else {
            debug!(client = %client_addr, sni = %server_name, "no route");
            self.outcome("no_route");
            return;
        };

        let started = std::time::Instant::now();
        let mut upstream = match dial_tcp(&target.authority(), self.dial_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(
                    client = %client_addr,
                    sni = %server_name,
                    dst = %target.dst(),
                    error = %e,
                    "upstream dial failed"
                );
                if let Some(breaker) = self.dispatcher.breaker() {
                    breaker.fail(target.dst());
                }
                self.outcome("dial_error");
                return;
            }
        };
        if let Some(breaker) = self.dispatcher.breaker() {
            breaker.success(target.dst());
        }
        self.dispatcher
            .timers()
            .timer(target.key())
            .update(started.elapsed());

        if let Err(e) = upstream.write_all(&hello.buffered).await {
            debug!(dst = %target.dst(), error = %e, "failed to replay ClientHello");
            self.outcome("dial_error");
            return;
        }

        debug!(client = %client_addr, sni = %server_name, dst = %target.dst(), "splicing");
        self.outcome("proxied");
        let result = splice(
            &mut client,
            &mut upstream,
            self.config.idle_timeout(),
            self.config.write_timeout(),
        )
        .await;
        match result {
            Ok((sent, received)) => debug!(
                client = %client_addr,
                dst = %target.dst(),
                sent,
                received,
                "connection closed"
            ),
            Err(e) => debug!(client = %client_addr, dst = %target.dst(), error = %e, "connection ended"),
        }
        let _ = client.shutdown().await;
        let _ = upstream.shutdown().await;
    }
}

/// Copy bytes both ways until either side closes
///
/// The idle deadline is reset by every read in either direction. Returns the
/// bytes sent from `a` to `b` and from `b` to `a`.
pub async fn splice<A, B>(
    a: &mut A,
    b: &mut B,
    idle_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a_buf = vec![0u8; SPLICE_BUFFER];
    let mut b_buf = vec![0u8; SPLICE_BUFFER];
    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let idle = tokio::time::sleep(idle_timeout.unwrap_or(Duration::MAX / 4));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            read = a.read(&mut a_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                write_with_deadline(b, &a_buf[..n], write_timeout).await?;
                a_to_b += n as u64;
            }
            read = b.read(&mut b_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                write_with_deadline(a, &b_buf[..n], write_timeout).await?;
                b_to_a += n as u64;
            }
            _ = &mut idle => {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout"));
            }
        }
        if let Some(timeout) = idle_timeout {
            idle.as_mut().reset(Instant::now() + timeout);
        }
    }
    Ok((a_to_b, b_to_a))
}

async fn write_with_deadline<W: AsyncWrite + Unpin>(
    w: &mut W,
    data: &[u8],
    timeout: Option<Duration>,
) -> std::io::Result<()> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, w.write_all(data))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))?,
        None => w.write_all(data).await,
    }
}
