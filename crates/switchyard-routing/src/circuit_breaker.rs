//! Circuit Breaker Implementation
//!
//! Each upstream destination has a consecutive-failure breaker with three states:
//! - Closed: Normal operation, the target is selectable
//! - Open: Too many consecutive failures, the target is excluded
//! - HalfOpen: Cool-down elapsed, the target is selectable again on probation
//!
//! State transitions:
//! - Closed → Open: After `failure_threshold` consecutive failures
//! - Open → HalfOpen: On the first monitor tick after the cool-down
//! - HalfOpen → Closed: On the next success
//! - HalfOpen → Open: On the next failure
//!
//! The dispatcher reports outcomes through a [`BreakerHandle`]. A single
//! [`BreakerMonitor`] task consumes the events and, whenever the set of open
//! breakers changes, publishes an overlay program of `route del * * <dst>`
//! lines that the registry watcher folds into the next table.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use switchyard_core::command::{Command, RouteDel};
use switchyard_observability::{CircuitBreakerState, Metrics};
use tokio::sync::{mpsc, watch};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - target is selectable
    Closed = 0,
    /// Tripped - target is excluded
    Open = 1,
    /// Probation after cool-down
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl From<CircuitState> for CircuitBreakerState {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => CircuitBreakerState::Closed,
            CircuitState::Open => CircuitBreakerState::Open,
            CircuitState::HalfOpen => CircuitBreakerState::HalfOpen,
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub cooldown: Duration,
    /// Interval of the monitor's periodic overlay refresh
    pub tick: Duration,
    /// Capacity of each event channel; events beyond it are dropped
    pub channel_capacity: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            tick: Duration::from_secs(15),
            channel_capacity: 100,
        }
    }
}

/// Circuit breaker for one destination
///
/// State is read lock-free by selection; transitions are made by the monitor.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Current circuit state (encoded as u8 for atomic operations)
    state: AtomicU8,
    failure_threshold: u32,
    cooldown: Duration,
    /// Consecutive failure count
    consecutive_failures: AtomicU32,
    /// Last time the state changed
    last_state_change: Mutex<Instant>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown,
            consecutive_failures: AtomicU32::new(0),
            last_state_change: Mutex::new(Instant::now()),
        }
    }

    /// Get the current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the target must be excluded from selection
    pub fn is_tripped(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Get the number of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Get the time since last state change
    pub fn time_since_state_change(&self) -> Duration {
        self.last_state_change
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    /// Record a successful request, returning the new state if it changed
    pub fn record_success(&self) -> Option<CircuitState> {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
                None
            }
            CircuitState::HalfOpen => Some(self.transition_to(CircuitState::Closed)),
            // Late event from before the trip
            CircuitState::Open => None,
        }
    }

    /// Record a failed request, returning the new state if it changed
    pub fn record_failure(&self) -> Option<CircuitState> {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.failure_threshold {
                    Some(self.transition_to(CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => Some(self.transition_to(CircuitState::Open)),
            CircuitState::Open => None,
        }
    }

    /// Move an open breaker to half-open once its cool-down has elapsed
    pub fn try_half_open(&self) -> Option<CircuitState> {
        if self.state() == CircuitState::Open && self.time_since_state_change() >= self.cooldown {
            Some(self.transition_to(CircuitState::HalfOpen))
        } else {
            None
        }
    }

    /// Force the circuit to open (useful for testing or manual intervention)
    pub fn force_open(&self) {
        self.transition_to(CircuitState::Open);
    }

    /// Force the circuit to close (useful for testing or manual intervention)
    pub fn force_close(&self) {
        self.transition_to(CircuitState::Closed);
    }

    fn transition_to(&self, state: CircuitState) -> CircuitState {
        self.state.store(state as u8, Ordering::Release);
        *self
            .last_state_change
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Instant::now();
        self.consecutive_failures.store(0, Ordering::Release);
        state
    }
}

/// Wrapper that can be shared across threads
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;

type BreakerMap = DashMap<String, SharedCircuitBreaker>;

/// Cheap, cloneable sender side used by the dispatcher
#[derive(Clone)]
pub struct BreakerHandle {
    fail_tx: mpsc::Sender<String>,
    success_tx: mpsc::Sender<String>,
    breakers: Arc<BreakerMap>,
}

impl BreakerHandle {
    /// Report a failed request to `dst`; dropped if the channel is full
    pub fn fail(&self, dst: &str) {
        if self.fail_tx.try_send(dst.to_string()).is_err() {
            tracing::debug!(dst = %dst, "breaker failure event dropped");
        }
    }

    /// Report a successful request to `dst`
    ///
    /// Only sent when it can change breaker state.
    pub fn success(&self, dst: &str) {
        let relevant = self.breakers.get(dst).is_some_and(|b| {
            b.state() != CircuitState::Closed || b.consecutive_failures() > 0
        });
        if relevant && self.success_tx.try_send(dst.to_string()).is_err() {
            tracing::debug!(dst = %dst, "breaker success event dropped");
        }
    }

    pub fn is_tripped(&self, dst: &str) -> bool {
        self.breakers.get(dst).is_some_and(|b| b.is_tripped())
    }

    pub fn state(&self, dst: &str) -> CircuitState {
        self.breakers
            .get(dst)
            .map_or(CircuitState::Closed, |b| b.state())
    }
}

/// Task that owns breaker transitions and publishes the overlay program
pub struct BreakerMonitor {
    config: CircuitBreakerConfig,
    breakers: Arc<BreakerMap>,
    fail_rx: mpsc::Receiver<String>,
    success_rx: mpsc::Receiver<String>,
    overlay_tx: watch::Sender<String>,
    metrics: Option<Arc<Metrics>>,
}

/// Create the breaker handle, its monitor and the overlay receiver
pub fn breaker_channel(
    config: CircuitBreakerConfig,
    metrics: Option<Arc<Metrics>>,
) -> (BreakerHandle, BreakerMonitor, watch::Receiver<String>) {
    let capacity = config.channel_capacity.max(1);
    let (fail_tx, fail_rx) = mpsc::channel(capacity);
    let (success_tx, success_rx) = mpsc::channel(capacity);
    let (overlay_tx, overlay_rx) = watch::channel(String::new());
    let breakers = Arc::new(DashMap::new());

    let handle = BreakerHandle {
        fail_tx,
        success_tx,
        breakers: breakers.clone(),
    };
    let monitor = BreakerMonitor {
        config,
        breakers,
        fail_rx,
        success_rx,
        overlay_tx,
        metrics,
    };
    (handle, monitor, overlay_rx)
}

impl BreakerMonitor {
    /// Run until every handle has been dropped
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut fail_open = true;
        let mut success_open = true;

        while fail_open || success_open {
            tokio::select! {
                event = self.fail_rx.recv(), if fail_open => match event {
                    Some(dst) => self.on_failure(&dst),
                    None => fail_open = false,
                },
                event = self.success_rx.recv(), if success_open => match event {
                    Some(dst) => self.on_success(&dst),
                    None => success_open = false,
                },
                _ = tick.tick() => self.on_tick(),
            }
        }
        tracing::debug!("breaker monitor stopped");
    }

    fn breaker(&self, dst: &str) -> SharedCircuitBreaker {
        if let Some(b) = self.breakers.get(dst) {
            return b.clone();
        }
        self.breakers
            .entry(dst.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&self.config)))
            .clone()
    }

    fn on_failure(&self, dst: &str) {
        let breaker = self.breaker(dst);
        let from = breaker.state();
        if let Some(to) = breaker.record_failure() {
            self.transitioned(dst, from, to);
        }
    }

    fn on_success(&self, dst: &str) {
        let Some(breaker) = self.breakers.get(dst).map(|b| b.clone()) else {
            return;
        };
        let from = breaker.state();
        if let Some(to) = breaker.record_success() {
            self.transitioned(dst, from, to);
        }
    }

    fn on_tick(&self) {
        let mut changed = false;
        for entry in self.breakers.iter() {
            let from = entry.value().state();
            if let Some(to) = entry.value().try_half_open() {
                self.log_transition(entry.key(), from, to);
                changed = true;
            }
        }
        // Closed breakers without pending failures carry no state worth keeping.
        self.breakers.retain(|_, b| {
            b.state() != CircuitState::Closed || b.consecutive_failures() > 0
        });
        if changed {
            self.publish_overlay();
        }
    }

    fn transitioned(&self, dst: &str, from: CircuitState, to: CircuitState) {
        self.log_transition(dst, from, to);
        self.publish_overlay();
    }

    fn log_transition(&self, dst: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => tracing::warn!(dst = %dst, "Circuit breaker opened"),
            CircuitState::HalfOpen => {
                tracing::info!(dst = %dst, "Circuit breaker half-open (testing recovery)")
            }
            CircuitState::Closed => tracing::info!(dst = %dst, "Circuit breaker closed (recovered)"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_transition(dst, from.into(), to.into());
        }
    }

    fn publish_overlay(&self) {
        let overlay = render_overlay(&self.breakers);
        self.overlay_tx.send_if_modified(|current| {
            if *current == overlay {
                false
            } else {
                *current = overlay;
                true
            }
        });
    }
}

/// `route del * * <dst>` for every open breaker, in sorted order
fn render_overlay(breakers: &BreakerMap) -> String {
    let mut open: Vec<String> = breakers
        .iter()
        .filter(|e| e.value().is_tripped())
        .map(|e| e.key().clone())
        .collect();
    open.sort();
    open.into_iter()
        .map(|dst| format!("{}\n", Command::Del(RouteDel::destination(dst))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(failure_threshold: u32, cooldown: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            cooldown,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::new(&CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_tripped());
    }

    #[test]
    fn test_closed_to_open_on_failure_threshold() {
        let cb = CircuitBreaker::new(&config(3, Duration::from_secs(60)));

        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.consecutive_failures(), 1);
        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.consecutive_failures(), 2);
        assert_eq!(cb.record_failure(), Some(CircuitState::Open));
        assert!(cb.is_tripped());
        assert_eq!(cb.consecutive_failures(), 0); // Reset on state change
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new(&config(3, Duration::from_secs(60)));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.record_success(), None);
        assert_eq!(cb.consecutive_failures(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_to_half_open_after_cooldown() {
        let cb = CircuitBreaker::new(&config(1, Duration::from_millis(100)));

        cb.record_failure();
        assert_eq!(cb.try_half_open(), None);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(cb.try_half_open(), Some(CircuitState::HalfOpen));
        assert!(!cb.is_tripped());
    }

    #[test]
    fn test_half_open_outcomes() {
        let cb = CircuitBreaker::new(&config(1, Duration::ZERO));

        cb.record_failure();
        cb.try_half_open();
        assert_eq!(cb.record_success(), Some(CircuitState::Closed));

        cb.record_failure();
        cb.try_half_open();
        assert_eq!(cb.record_failure(), Some(CircuitState::Open));
    }

    #[test]
    fn test_events_while_open_are_ignored() {
        let cb = CircuitBreaker::new(&config(1, Duration::from_secs(60)));
        cb.force_open();
        assert_eq!(cb.record_success(), None);
        assert_eq!(cb.record_failure(), None);
        assert!(cb.is_tripped());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_render_overlay() {
        let breakers: BreakerMap = DashMap::new();
        let cfg = CircuitBreakerConfig::default();
        for dst in ["http://b/", "http://a/", "http://c/"] {
            breakers.insert(dst.to_string(), Arc::new(CircuitBreaker::new(&cfg)));
        }
        breakers.get("http://b/").unwrap().force_open();
        breakers.get("http://a/").unwrap().force_open();

        assert_eq!(
            render_overlay(&breakers),
            "route del * * http://a/\nroute del * * http://b/\n"
        );
    }

    #[tokio::test]
    async fn test_monitor_publishes_overlay_after_threshold() {
        let (handle, monitor, mut overlay) = breaker_channel(
            CircuitBreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
            None,
        );
        tokio::spawn(monitor.run());

        for _ in 0..3 {
            handle.fail("http://down/");
        }

        tokio::time::timeout(Duration::from_secs(2), overlay.changed())
            .await
            .expect("overlay not published")
            .unwrap();
        assert_eq!(*overlay.borrow(), "route del * * http://down/\n");
        assert!(handle.is_tripped("http://down/"));
        assert_eq!(handle.state("http://up/"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_monitor_recovers_after_cooldown() {
        let (handle, monitor, mut overlay) = breaker_channel(
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(50),
                tick: Duration::from_millis(20),
                channel_capacity: 10,
            },
            None,
        );
        tokio::spawn(monitor.run());

        handle.fail("http://flaky/");
        tokio::time::timeout(Duration::from_secs(2), overlay.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!overlay.borrow_and_update().is_empty());

        // Cool-down elapses on a tick: the deletion is withdrawn
        tokio::time::timeout(Duration::from_secs(2), overlay.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(overlay.borrow_and_update().is_empty());
        assert_eq!(handle.state("http://flaky/"), CircuitState::HalfOpen);

        handle.success("http://flaky/");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state("http://flaky/"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_full_channel_drops_events() {
        let (handle, _monitor, _overlay) = breaker_channel(
            CircuitBreakerConfig {
                channel_capacity: 2,
                ..Default::default()
            },
            None,
        );
        // Monitor not running: sends beyond capacity must not block or panic
        for _ in 0..10 {
            handle.fail("http://x/");
        }
    }
}
