//! Registry watcher
//!
//! Merges the latest services program, manual overlay and breaker overlay,
//! compiles them and publishes the result. Bursts of updates are coalesced:
//! after the first change the watcher waits out the debounce window, folding
//! in anything else that arrives, then compiles once.
//!
//! A program that fails to parse is logged and dropped; the published table
//! stays in place. A registry stream that ends or cannot be opened is
//! re-subscribed with capped exponential backoff.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::Registry;
use switchyard_observability::Metrics;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::matcher::MatcherKind;
use crate::publisher::TablePublisher;
use crate::table::Table;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Coalescing window after a change
    pub debounce: Duration,
    /// Upper bound for registry re-subscribe backoff
    pub max_backoff: Duration,
    pub matcher: MatcherKind,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(10),
            max_backoff: Duration::from_secs(30),
            matcher: MatcherKind::Prefix,
        }
    }
}

#[derive(Debug)]
enum Update {
    Services(String),
    Manual(String),
    Overlay(String),
}

#[derive(Debug, Default)]
struct Inputs {
    services: String,
    manual: String,
    overlay: String,
}

impl Inputs {
    fn apply(&mut self, update: Update) {
        match update {
            Update::Services(p) => self.services = p,
            Update::Manual(p) => self.manual = p,
            Update::Overlay(p) => self.overlay = p,
        }
    }

    fn program(&self) -> String {
        format!("{}\n{}\n{}", self.services, self.manual, self.overlay)
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Services,
    Manual,
}

impl Source {
    fn name(&self) -> &'static str {
        match self {
            Source::Services => "services",
            Source::Manual => "manual",
        }
    }
}

pub struct RegistryWatcher {
    registry: Arc<dyn Registry>,
    publisher: Arc<TablePublisher>,
    overlay: Option<watch::Receiver<String>>,
    config: WatcherConfig,
    metrics: Option<Arc<Metrics>>,
}

impl RegistryWatcher {
    pub fn new(
        registry: Arc<dyn Registry>,
        publisher: Arc<TablePublisher>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            overlay: None,
            config,
            metrics: None,
        }
    }

    /// Fold the breaker overlay into every compile
    pub fn with_overlay(mut self, overlay: watch::Receiver<String>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every input source has stopped
    pub async fn run(self) {
        let (tx, mut rx) = mpsc::channel::<Update>(64);

        let feeders = [Source::Services, Source::Manual].map(|source| {
            tokio::spawn(feed_registry(
                self.registry.clone(),
                source,
                tx.clone(),
                self.config.max_backoff,
            ))
        });
        if let Some(overlay) = self.overlay.clone() {
            tokio::spawn(feed_overlay(overlay, tx.clone()));
        }
        drop(tx);

        let mut inputs = Inputs::default();
        while let Some(update) = rx.recv().await {
            inputs.apply(update);

            let window = tokio::time::sleep(self.config.debounce);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    next = rx.recv() => match next {
                        Some(update) => inputs.apply(update),
                        None => break,
                    },
                }
            }

            self.compile_and_publish(&inputs);
        }

        for feeder in feeders {
            feeder.abort();
        }
        tracing::info!("registry watcher stopped");
    }

    fn compile_and_publish(&self, inputs: &Inputs) {
        let program = inputs.program();
        match Table::compile(&program, self.config.matcher) {
            Ok(table) => {
                let routes = table.len();
                let generation = self.publisher.publish(table);
                tracing::info!(
                    generation,
                    routes,
                    bytes = program.len(),
                    "published routing table"
                );
            }
            Err(errors) => {
                for error in errors.iter() {
                    tracing::warn!(
                        line = error.line,
                        column = error.column,
                        text = %error.text,
                        "{}",
                        error.message
                    );
                }
                tracing::warn!(
                    errors = errors.len(),
                    "rejected routing update, keeping previous table"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_table_rejected();
                }
            }
        }
    }
}

async fn feed_registry(
    registry: Arc<dyn Registry>,
    source: Source,
    tx: mpsc::Sender<Update>,
    max_backoff: Duration,
) {
    let mut backoff = INITIAL_BACKOFF.min(max_backoff);
    loop {
        let stream = match source {
            Source::Services => registry.watch_services().await,
            Source::Manual => registry.watch_manual().await,
        };
        match stream {
            Ok(mut stream) => {
                let mut received = false;
                while let Some(program) = stream.next().await {
                    received = true;
                    let update = match source {
                        Source::Services => Update::Services(program),
                        Source::Manual => Update::Manual(program),
                    };
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                if received {
                    backoff = INITIAL_BACKOFF.min(max_backoff);
                }
                tracing::warn!(source = source.name(), "registry stream ended, re-subscribing");
            }
            Err(e) => {
                tracing::warn!(source = source.name(), error = %e, "registry watch failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn feed_overlay(mut overlay: watch::Receiver<String>, tx: mpsc::Sender<Update>) {
    let initial = overlay.borrow_and_update().clone();
    if !initial.is_empty() && tx.send(Update::Overlay(initial)).await.is_err() {
        return;
    }
    while overlay.changed().await.is_ok() {
        let program = overlay.borrow_and_update().clone();
        if tx.send(Update::Overlay(program)).await.is_err() {
            return;
        }
    }
}
