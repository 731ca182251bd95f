//! Target selection strategies
//!
//! ## Strategies
//!
//! ### Random (`rnd`)
//! Samples a uniform `r` in `[0, 1)` and picks the first target whose
//! cumulative normalized weight exceeds `r`. A route whose weights are all
//! zero is sampled uniformly.
//!
//! ### Round-robin (`rr`)
//! Walks the route's precomputed slot ring with a counter kept per route
//! identity, so the rotation survives table rebuilds.
//!
//! ```rust
//! use switchyard_routing::{MatcherKind, Selector, Strategy, Table};
//!
//! let table = Table::compile(
//!     "route add s / http://h1/ weight 0.5\nroute add s / http://h2/ weight 0.5",
//!     MatcherKind::Prefix,
//! ).unwrap();
//! let route = table.lookup("example.com", "/").unwrap();
//!
//! let selector = Selector::new(Strategy::RoundRobin);
//! let first = selector.select(route, |_| false).unwrap();
//! let second = selector.select(route, |_| false).unwrap();
//! assert_ne!(first.dst(), second.dst());
//! ```
//!
//! ## Tripped targets
//!
//! Targets reported as tripped are skipped. Selection resamples a bounded
//! number of times, then takes the first eligible target in route order. A
//! route with no eligible target yields no selection.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::table::{Route, Table, Target};

/// Resample attempts before falling back to a scan
const MAX_RESAMPLES: usize = 8;

/// Selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    #[default]
    #[serde(rename = "rnd")]
    Rnd,
    #[serde(rename = "rr")]
    RoundRobin,
}

impl std::str::FromStr for Strategy {
    type Err = StrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rnd" => Ok(Strategy::Rnd),
            "rr" => Ok(Strategy::RoundRobin),
            other => Err(StrategyError::Unknown(other.to_string())),
        }
    }
}

/// Strategy execution state (maintains round-robin counters between requests)
#[derive(Debug, Default)]
pub struct Selector {
    strategy: Strategy,
    /// Round-robin counters keyed by route identity
    counters: DashMap<String, AtomicUsize>,
}

impl Selector {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            counters: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select a target from `route`, skipping targets for which `tripped` is true
    pub fn select<'a, F>(&self, route: &'a Route, tripped: F) -> Option<&'a Target>
    where
        F: Fn(&Target) -> bool,
    {
        if route.targets.is_empty() {
            return None;
        }

        for _ in 0..MAX_RESAMPLES {
            let idx = match self.strategy {
                Strategy::Rnd => pick_weighted(route, rand::rng().random::<f64>()),
                Strategy::RoundRobin => self.next_slot(route),
            };
            let target = &route.targets[idx];
            if !tripped(target) {
                return Some(target);
            }
        }

        let weighted = !route.cumulative().is_empty();
        let weights = route.normalized_weights();
        route
            .targets
            .iter()
            .enumerate()
            .find(|(i, t)| (!weighted || weights[*i] > 0.0) && !tripped(t))
            .map(|(_, t)| t)
    }

    /// Drop round-robin counters of routes no longer in `table`
    pub fn retain_routes(&self, table: &Table) {
        let live: HashSet<&str> = table.routes().map(Route::id).collect();
        self.counters.retain(|id, _| live.contains(id.as_str()));
    }

    /// Number of routes with a round-robin counter
    pub fn tracked_routes(&self) -> usize {
        self.counters.len()
    }

    fn next_slot(&self, route: &Route) -> usize {
        let ring = route.ring();
        if ring.is_empty() {
            return 0;
        }
        let count = match self.counters.get(route.id()) {
            Some(counter) => counter.fetch_add(1, Ordering::AcqRel),
            None => self
                .counters
                .entry(route.id().to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::AcqRel),
        };
        ring[count % ring.len()]
    }
}

/// Index of the target selected by sample `r` in `[0, 1)`
pub fn pick_weighted(route: &Route, r: f64) -> usize {
    let cumulative = route.cumulative();
    if cumulative.is_empty() {
        let n = route.targets.len();
        return ((r * n as f64) as usize).min(n - 1);
    }
    cumulative
        .partition_point(|c| *c <= r)
        .min(cumulative.len() - 1)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("Unknown strategy '{0}', expected 'rnd' or 'rr'")]
    Unknown(String),
}
