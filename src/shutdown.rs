use std::sync::Arc;

use tokio::sync::watch;

/// Creates a linked trigger/signal pair for engine-wide shutdown.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx, _tx: None })
}

/// Owner side of the shutdown signal, held by the process bootstrap.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Fires the signal. Every in-flight wait observes it within one
    /// polling interval.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cloneable receiver observed by every poll loop and settle wait.
///
/// A dropped trigger counts as shutdown, so orphaned tasks cannot hang.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    // set only by `never`: holds its sender so the channel stays open for
    // as long as any clone of the signal lives
    _tx: Option<Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    /// A signal that never fires. For callers embedding the engine without
    /// process-lifecycle management.
    pub fn never() -> Shutdown {
        let (tx, rx) = watch::channel(false);
        Shutdown {
            rx,
            _tx: Some(Arc::new(tx)),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn requested(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
