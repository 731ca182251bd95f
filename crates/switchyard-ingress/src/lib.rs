//! Switchyard Ingress
//!
//! Client-facing side of the proxy:
//! - [`http`]: HTTP/1.1 and HTTP/2 listener driving the [`Dispatcher`]
//! - [`tcp`]: TCP listener routing TLS connections by SNI
//! - [`dispatch`]: per-request routing, redirects and upstream forwarding
//! - [`websocket`]: upgrade handshake relay and byte splicing
//! - [`proxy_protocol`], [`sni`]: connection preamble parsing

pub mod dispatch;
pub mod forward;
pub mod http;
pub mod io;
pub mod listener;
pub mod proxy_protocol;
pub mod shutdown;
pub mod sni;
pub mod tcp;
pub mod websocket;

pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig};
pub use forward::{ForwardConfig, HeaderAction, HeaderRule};
pub use http::HttpServer;
pub use listener::{ListenerConfig, ListenerProto};
pub use shutdown::{ConnectionGuard, ConnectionTracker, Drain};
pub use tcp::TcpSniServer;
