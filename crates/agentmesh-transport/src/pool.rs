use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds outbound HTTP concurrency per destination node. `reqwest::Client`
/// already pools TCP connections internally; this layers the explicit
/// per-node cap on top, so the cap is testable independent
/// of `reqwest`'s own pooling behavior.
pub struct ConnectionPool {
    max_per_node: usize,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConnectionPool {
    pub fn new(max_per_node: usize) -> Self {
        Self {
            max_per_node,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, node_slug: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock();
        slots
            .entry(node_slug.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_node)))
            .clone()
    }

    pub async fn acquire(&self, node_slug: &str) -> OwnedSemaphorePermit {
        let semaphore = self.semaphore_for(node_slug);
        semaphore
            .acquire_owned()
            .await
            .expect("connection pool semaphore never closed")
    }
}
