//! Switchyard Routing Engine
//!
//! This crate provides the routing logic for Switchyard:
//! - Routing table model, compiled from route programs
//! - Prefix and glob path matching
//! - Weighted target selection (random and round-robin)
//! - Per-target circuit breakers that feed deletions back into the table
//! - Lock-free table publishing and the registry watcher

pub mod circuit_breaker;
pub mod matcher;
pub mod publisher;
pub mod strategy;
pub mod table;
pub mod watcher;

// Re-export commonly used types
pub use circuit_breaker::{
    BreakerHandle, BreakerMonitor, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    breaker_channel,
};
pub use matcher::{MatcherKind, PathMatcher};
pub use publisher::{SharedPublisher, TablePublisher};
pub use strategy::{Selector, Strategy, StrategyError};
pub use table::{Route, Table, Target, normalize_host};
pub use watcher::{RegistryWatcher, WatcherConfig};
