//! Serialized callback dispatch.
//!
//! Job updates and session shutdown callbacks run on one dedicated task
//! per owner, so a caller never observes two updates for the same job
//! concurrently and callbacks cannot block the exchange paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

type Event = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    pending: Arc<AtomicUsize>,
}

impl EventQueue {
    /// Start the dispatcher task and return its queue handle.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let pending = Arc::new(AtomicUsize::new(0));
        let count = pending.clone();
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                ev();
                count.fetch_sub(1, Ordering::AcqRel);
            }
        });
        EventQueue { tx, pending }
    }

    /// Queue one callback. Dropped silently after `close`.
    pub fn queue<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Box::new(f)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Number of callbacks not yet executed.
    pub fn count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
