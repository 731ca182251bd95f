//! Drain state shared by listeners and the dispatcher

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Process-wide draining flag
///
/// Once started, the dispatcher answers new requests with 503 and listeners
/// stop accepting. Checking the flag is a single atomic load.
#[derive(Clone)]
pub struct Drain {
    draining: Arc<AtomicBool>,
    signal: Arc<watch::Sender<bool>>,
}

impl Drain {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            draining: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(signal),
        }
    }

    /// Begin draining; idempotent
    pub fn start(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            tracing::info!("draining connections");
        }
        self.signal.send_replace(true);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Resolve once draining has started
    pub async fn started(&self) {
        let mut rx = self.signal.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|draining| *draining).await;
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}

/// Open-connection count of one listener
///
/// Every accepted connection holds a [`ConnectionGuard`]. Work that outlives
/// the connection's HTTP exchange, such as an upgraded WebSocket, keeps a
/// clone of the guard until it finishes.
pub struct ConnectionTracker {
    tx: watch::Sender<()>,
    rx: watch::Receiver<()>,
}

/// Keeps its listener's shutdown waiting while alive
#[derive(Clone)]
pub struct ConnectionGuard(#[allow(dead_code)] watch::Receiver<()>);

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(());
        Self { tx, rx }
    }

    pub fn guard(&self) -> ConnectionGuard {
        ConnectionGuard(self.rx.clone())
    }

    /// Guards currently alive
    pub fn open(&self) -> usize {
        self.tx.receiver_count().saturating_sub(1)
    }

    /// Wait up to `timeout` for every guard to drop; false when some remain
    pub async fn wait(self, timeout: Duration) -> bool {
        let Self { tx, rx } = self;
        drop(rx);
        tokio::time::timeout(timeout, tx.closed()).await.is_ok()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
