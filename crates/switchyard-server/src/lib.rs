//! Switchyard server
//!
//! Configuration loading, process wiring and the admin API behind the
//! `switchyard` binary.

pub mod admin;
pub mod app;
pub mod config;

pub use admin::{AdminState, RouteEntry, admin_router};
pub use app::{App, BoundApp};
pub use config::{ConfigError, ServerConfig};
