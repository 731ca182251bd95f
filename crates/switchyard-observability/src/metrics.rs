//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for Switchyard:
//! - Request counts by service and status class
//! - Upstream latency histograms
//! - Upstream error counts by kind
//! - Circuit breaker state and transitions per target
//! - Routing table publishes, rejected updates and route count
//! - Layer-4 connection counts

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for Switchyard
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Request metrics
    /// Requests handled, by service and status class (2xx, 3xx, ...)
    pub requests_total: CounterVec,
    /// Upstream round-trip duration
    pub request_duration_seconds: HistogramVec,
    /// Upstream failures by kind (dial, timeout, response, status)
    pub upstream_errors_total: CounterVec,
    /// Requests that matched no route
    pub no_route_total: IntCounter,

    // Circuit breaker metrics
    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub circuit_breaker_state: GaugeVec,
    /// Circuit breaker state changes
    pub circuit_breaker_transitions: CounterVec,

    // Routing table metrics
    /// Tables published by the watcher
    pub table_publishes_total: IntCounter,
    /// Updates rejected because the program failed to parse
    pub table_rejected_total: IntCounter,
    /// Routes in the active table
    pub routes: IntGauge,

    // Layer-4 metrics
    /// TCP+SNI connections by outcome
    pub tcp_connections_total: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("switchyard_requests_total", "Total number of proxied requests"),
            &["service", "status"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "switchyard_request_duration_seconds",
                "Upstream request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["service"],
        )?;

        let upstream_errors_total = CounterVec::new(
            Opts::new(
                "switchyard_upstream_errors_total",
                "Total number of failed upstream requests",
            ),
            &["service", "kind"],
        )?;

        let no_route_total = IntCounter::new(
            "switchyard_no_route_total",
            "Requests that matched no route",
        )?;

        let circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "switchyard_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["target"],
        )?;

        let circuit_breaker_transitions = CounterVec::new(
            Opts::new(
                "switchyard_circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["target", "from_state", "to_state"],
        )?;

        let table_publishes_total = IntCounter::new(
            "switchyard_table_publishes_total",
            "Routing tables published",
        )?;

        let table_rejected_total = IntCounter::new(
            "switchyard_table_rejected_total",
            "Routing updates rejected due to parse errors",
        )?;

        let routes = IntGauge::new("switchyard_routes", "Routes in the active table")?;

        let tcp_connections_total = CounterVec::new(
            Opts::new(
                "switchyard_tcp_connections_total",
                "TCP+SNI connections by outcome",
            ),
            &["outcome"],
        )?;

        // Register all metrics
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;
        registry.register(Box::new(no_route_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;
        registry.register(Box::new(table_publishes_total.clone()))?;
        registry.register(Box::new(table_rejected_total.clone()))?;
        registry.register(Box::new(routes.clone()))?;
        registry.register(Box::new(tcp_connections_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            requests_total,
            request_duration_seconds,
            upstream_errors_total,
            no_route_total,
            circuit_breaker_state,
            circuit_breaker_transitions,
            table_publishes_total,
            table_rejected_total,
            routes,
            tcp_connections_total,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a completed upstream request
    pub fn record_request(&self, service: &str, status: u16, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[service, status_class(status)])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[service])
            .observe(duration_secs);
    }

    /// Record a failed upstream request
    pub fn record_upstream_error(&self, service: &str, kind: &str) {
        self.upstream_errors_total
            .with_label_values(&[service, kind])
            .inc();
    }

    pub fn record_no_route(&self) {
        self.no_route_total.inc();
    }

    /// Update circuit breaker state
    pub fn update_circuit_breaker_state(&self, target: &str, state: CircuitBreakerState) {
        self.circuit_breaker_state
            .with_label_values(&[target])
            .set(state as i64 as f64);
    }

    /// Record circuit breaker transition
    pub fn record_circuit_breaker_transition(
        &self,
        target: &str,
        from: CircuitBreakerState,
        to: CircuitBreakerState,
    ) {
        self.circuit_breaker_transitions
            .with_label_values(&[target, from.as_str(), to.as_str()])
            .inc();
        self.update_circuit_breaker_state(target, to);
    }

    /// Record a routing table publish
    pub fn record_table_published(&self, route_count: usize) {
        self.table_publishes_total.inc();
        self.routes.set(route_count as i64);
    }

    pub fn record_table_rejected(&self) {
        self.table_rejected_total.inc();
    }

    /// Record a TCP+SNI connection outcome (proxied, no_route, no_sni, dial_error)
    pub fn record_tcp_connection(&self, outcome: &str) {
        self.tcp_connections_total
            .with_label_values(&[outcome])
            .inc();
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Circuit breaker state for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitBreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}
