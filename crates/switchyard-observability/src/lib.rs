//! Switchyard Observability
//!
//! This crate provides observability features:
//! - Metrics collection (Prometheus)
//! - Per-target request timers (1-minute rate, latency percentiles)
//! - Structured logging initialization
//! - Health endpoints

pub mod health;
pub mod logging;
pub mod metrics;
pub mod timer;

pub use health::{HealthState, ReadinessChecker, health_router};
pub use logging::LoggingConfig;
pub use metrics::{CircuitBreakerState, Metrics};
pub use timer::{Timer, TimerRegistry, TimerSnapshot};
