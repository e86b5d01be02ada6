//! Change notification fan-out.
//!
//! Subscribers receive `(previous, current)` copies of every item a graph
//! mutation changes. They run synchronously on the mutating thread while the
//! graph's write lock is held, so they must be quick and must not call back
//! into the graph.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use topograph_core::Item;

/// Subscriber callback. `prev` is `None` when the item was just created.
pub type Callback = dyn Fn(Option<&Item>, &Item) -> anyhow::Result<()> + Send + Sync;

/// Ordered list of subscribers attached to a graph.
#[derive(Default)]
pub struct Notifier {
    subscribers: RwLock<Vec<Arc<Callback>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber. The same closure may be subscribed twice; it is
    /// then called twice.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Option<&Item>, &Item) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.write();
        subscribers.push(Arc::new(callback));
        tracing::debug!(subscribers = subscribers.len(), "Subscriber added");
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscribers.read().is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Invoke every subscriber in subscription order.
    ///
    /// A subscriber that returns an error or panics is logged and skipped;
    /// the rest still run. Returns the number of failed subscribers.
    pub fn notify(&self, prev: Option<&Item>, curr: &Item) -> usize {
        // Snapshot the list so a subscriber may subscribe others without deadlocking.
        let subscribers: Vec<Arc<Callback>> = self.subscribers.read().clone();
        let mut failures = 0;

        for (index, callback) in subscribers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(prev, curr))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(
                        subscriber = index,
                        item = %curr.id(),
                        error = %e,
                        "Subscriber failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!(subscriber = index, item = %curr.id(), "Subscriber panicked");
                }
            }
        }

        failures
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
