//! Active routing table
//!
//! The publisher owns the process-wide reference to the current [`Table`].
//! Readers take one atomic load per request and keep the table alive for as
//! long as they hold it; a publish swaps the reference without blocking them.
//! The previous table is freed when its last reader lets go.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use switchyard_observability::{Metrics, ReadinessChecker};
use tokio::sync::watch;

use crate::table::Table;

pub struct TablePublisher {
    active: ArcSwap<Table>,
    generation: AtomicU64,
    generation_tx: watch::Sender<u64>,
    metrics: Option<Arc<Metrics>>,
}

/// A shared reference to the publisher
pub type SharedPublisher = Arc<TablePublisher>;

impl TablePublisher {
    /// Start with an empty table at generation 0
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            active: ArcSwap::from_pointee(Table::empty()),
            generation: AtomicU64::new(0),
            generation_tx,
            metrics,
        }
    }

    /// The current table
    pub fn load(&self) -> Arc<Table> {
        self.active.load_full()
    }

    /// Atomically replace the active table, returning the new generation
    pub fn publish(&self, table: Table) -> u64 {
        let routes = table.len();
        self.active.store(Arc::new(table));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.generation_tx.send_replace(generation);
        if let Some(metrics) = &self.metrics {
            metrics.record_table_published(routes);
        }
        generation
    }

    /// Number of tables published so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Receive the generation number after every publish
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }
}

impl ReadinessChecker for TablePublisher {
    fn is_ready(&self) -> bool {
        self.generation() > 0 && !self.active.load().is_empty()
    }

    fn route_count(&self) -> usize {
        self.active.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::MatcherKind;

    fn compile(program: &str) -> Table {
        Table::compile(program, MatcherKind::Prefix).unwrap()
    }

    #[test]
    fn test_starts_empty_and_not_ready() {
        let publisher = TablePublisher::new(None);
        assert!(publisher.load().is_empty());
        assert_eq!(publisher.generation(), 0);
        assert!(!publisher.is_ready());
    }

    #[test]
    fn test_publish_swaps_table() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let publisher = TablePublisher::new(Some(metrics.clone()));
        let held = publisher.load();

        let generation = publisher.publish(compile("route add s / http://h1/"));
        assert_eq!(generation, 1);
        assert!(publisher.is_ready());
        assert_eq!(publisher.route_count(), 1);
        assert_eq!(metrics.routes.get(), 1);

        // A reader holding the old table keeps seeing it
        assert!(held.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_generations() {
        let publisher = TablePublisher::new(None);
        let mut rx = publisher.subscribe();
        publisher.publish(compile("route add s / http://h1/"));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_readers_see_whole_tables_under_concurrent_publish() {
        let publisher = Arc::new(TablePublisher::new(None));
        let a = "route add s / http://a1/\nroute add s /x http://a2/";
        let b = "route add s / http://b1/\nroute add s /x http://b2/";
        publisher.publish(compile(a));

        let writer = {
            let publisher = publisher.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    publisher.publish(compile(if i % 2 == 0 { b } else { a }));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                std::thread::spawn(move || {
                    for _ in 0..20_000 {
                        let table = publisher.load();
                        let root = table.lookup("h", "/").unwrap().targets[0].dst().to_string();
                        let x = table.lookup("h", "/x").unwrap().targets[0].dst().to_string();
                        // both routes always come from the same program
                        assert_eq!(&root[..8], &x[..8]);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
