//! Per-target request timers
//!
//! Each target owns a [`Timer`] that records upstream latency. A timer exposes
//! a one-minute exponentially weighted request rate and latency percentiles
//! over a bounded window of recent samples.
//!
//! Timers are keyed by target identity (`service|dst`) in a [`TimerRegistry`]
//! so they survive routing table rebuilds.
//!
//! The rate is ticked lazily: every update or read first folds in all 5-second
//! intervals that elapsed since the previous tick.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const RATE_WINDOW_SECS: f64 = 60.0;
const MAX_SAMPLES: usize = 1028;

/// Idle ticks after which the rate is treated as fully decayed
const MAX_CATCHUP_TICKS: u64 = 720;

#[derive(Debug)]
struct Ewma {
    alpha: f64,
    rate: f64,
    uncounted: u64,
    initialized: bool,
    last_tick: Instant,
}

impl Ewma {
    fn new(now: Instant) -> Self {
        Self {
            alpha: 1.0 - (-TICK_INTERVAL.as_secs_f64() / RATE_WINDOW_SECS).exp(),
            rate: 0.0,
            uncounted: 0,
            initialized: false,
            last_tick: now,
        }
    }

    fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL.as_secs_f64();
        self.uncounted = 0;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }

    fn catch_up(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let ticks = (elapsed.as_nanos() / TICK_INTERVAL.as_nanos()) as u64;
        if ticks == 0 {
            return;
        }
        if ticks > MAX_CATCHUP_TICKS {
            self.tick();
            self.rate = 0.0;
            self.last_tick = now;
            return;
        }
        for _ in 0..ticks {
            self.tick();
        }
        self.last_tick += TICK_INTERVAL * ticks as u32;
    }
}

#[derive(Debug)]
struct TimerState {
    ewma: Ewma,
    /// Ring buffer of recent latencies in nanoseconds
    samples: Vec<u64>,
    next: usize,
}

/// Latency and rate tracker for one target
#[derive(Debug)]
pub struct Timer {
    count: AtomicU64,
    state: Mutex<TimerState>,
}

/// Point-in-time view of a timer, latencies in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub rate1: f64,
    pub p50: f64,
    pub p99: f64,
}

impl Timer {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            count: AtomicU64::new(0),
            state: Mutex::new(TimerState {
                ewma: Ewma::new(now),
                samples: Vec::with_capacity(64),
                next: 0,
            }),
        }
    }

    /// Record one request that took `elapsed`
    pub fn update(&self, elapsed: Duration) {
        self.update_at(elapsed, Instant::now());
    }

    fn update_at(&self, elapsed: Duration, now: Instant) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.ewma.catch_up(now);
        state.ewma.uncounted += 1;
        if state.samples.len() < MAX_SAMPLES {
            state.samples.push(nanos);
        } else {
            let idx = state.next;
            state.samples[idx] = nanos;
        }
        state.next = (state.next + 1) % MAX_SAMPLES;
    }

    /// Total number of recorded requests
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// One-minute exponentially weighted rate in requests per second
    pub fn rate1(&self) -> f64 {
        self.rate1_at(Instant::now())
    }

    fn rate1_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.ewma.catch_up(now);
        state.ewma.rate
    }

    /// Latency at quantile `p` (0.0..=1.0) over the recent sample window
    pub fn percentile(&self, p: f64) -> Duration {
        let mut sorted = {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.samples.clone()
        };
        sorted.sort_unstable();
        Duration::from_nanos(quantile(&sorted, p) as u64)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let mut sorted = {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.samples.clone()
        };
        sorted.sort_unstable();
        TimerSnapshot {
            count: self.count(),
            rate1: self.rate1(),
            p50: quantile(&sorted, 0.5) / 1e6,
            p99: quantile(&sorted, 0.99) / 1e6,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpolated quantile of an ascending slice, in the slice's unit
fn quantile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    let n = sorted.len() as f64;
    let pos = p * (n + 1.0);
    if pos < 1.0 {
        sorted[0] as f64
    } else if pos >= n {
        sorted[sorted.len() - 1] as f64
    } else {
        let lower = sorted[pos as usize - 1] as f64;
        let upper = sorted[pos as usize] as f64;
        lower + (pos - pos.floor()) * (upper - lower)
    }
}

/// Timers keyed by target identity
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: DashMap<String, Arc<Timer>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the timer for `key`, creating it on first use
    pub fn timer(&self, key: &str) -> Arc<Timer> {
        if let Some(timer) = self.timers.get(key) {
            return timer.clone();
        }
        self.timers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Timer::new()))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Timer>> {
        self.timers.get(key).map(|t| t.clone())
    }

    pub fn snapshot(&self, key: &str) -> Option<TimerSnapshot> {
        self.timers.get(key).map(|t| t.snapshot())
    }

    /// Drop timers whose key is not in `live`
    pub fn retain_keys<F>(&self, mut live: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.timers.retain(|key, _| live(key));
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_is_zero_before_first_tick() {
        let start = Instant::now();
        let timer = Timer::starting_at(start);
        for _ in 0..10 {
            timer.update_at(Duration::from_millis(5), start);
        }
        assert_eq!(timer.rate1_at(start + Duration::from_secs(1)), 0.0);
        assert_eq!(timer.count(), 10);
    }

    #[test]
    fn test_first_tick_sets_instant_rate() {
        let start = Instant::now();
        let timer = Timer::starting_at(start);
        for _ in 0..60 {
            timer.update_at(Duration::from_millis(1), start);
        }
        let rate = timer.rate1_at(start + TICK_INTERVAL);
        assert!((rate - 12.0).abs() < 1e-9, "rate was {}", rate);
    }

    #[test]
    fn test_rate_decays_when_idle() {
        let start = Instant::now();
        let timer = Timer::starting_at(start);
        for _ in 0..60 {
            timer.update_at(Duration::from_millis(1), start);
        }
        let first = timer.rate1_at(start + TICK_INTERVAL);
        let later = timer.rate1_at(start + TICK_INTERVAL * 13);
        assert!(later < first);
        // one minute of idle ticks decays by a factor of e
        assert!((later - first / std::f64::consts::E).abs() < 0.01, "later was {}", later);

        let much_later = timer.rate1_at(start + Duration::from_secs(24 * 3600));
        assert_eq!(much_later, 0.0);
    }

    #[test]
    fn test_percentiles() {
        let timer = Timer::new();
        for ms in 1..=100 {
            timer.update(Duration::from_millis(ms));
        }
        let p50 = timer.percentile(0.5);
        let p99 = timer.percentile(0.99);
        assert!(p50 >= Duration::from_millis(50) && p50 <= Duration::from_millis(51));
        assert!(p99 >= Duration::from_millis(99) && p99 <= Duration::from_millis(100));
        assert_eq!(timer.percentile(0.0), Duration::from_millis(1));
        assert_eq!(timer.percentile(1.0), Duration::from_millis(100));
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let timer = Timer::new();
        for _ in 0..MAX_SAMPLES {
            timer.update(Duration::from_secs(1));
        }
        for _ in 0..MAX_SAMPLES {
            timer.update(Duration::from_millis(1));
        }
        assert_eq!(timer.percentile(0.99), Duration::from_millis(1));
        assert_eq!(timer.count(), 2 * MAX_SAMPLES as u64);
    }

    #[test]
    fn test_empty_timer_snapshot() {
        let snapshot = Timer::new().snapshot();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.p99, 0.0);
    }

    #[test]
    fn test_registry_shares_timers_by_key() {
        let registry = TimerRegistry::new();
        registry.timer("svc|http://h1/").update(Duration::from_millis(3));
        registry.timer("svc|http://h1/").update(Duration::from_millis(3));
        registry.timer("svc|http://h2/");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot("svc|http://h1/").unwrap().count, 2);
        assert!(registry.get("other|http://h1/").is_none());

        registry.retain_keys(|k| k.ends_with("h1/"));
        assert_eq!(registry.len(), 1);
    }
}
