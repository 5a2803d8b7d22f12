//! Reusable pool of storage sessions.
//!
//! Sessions come out of a fixed-capacity lock-free queue. A miss allocates a
//! fresh session from the client; a release back into a full queue drops the
//! handle instead of blocking.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::metrics::EngineMetrics;
use crate::types::{StoreClient, StoreSession};

pub struct SessionPool {
    client: Arc<dyn StoreClient>,
    timeout: Duration,
    queue: ArrayQueue<Arc<dyn StoreSession>>,
    owned: Mutex<Vec<Arc<dyn StoreSession>>>,
    metrics: Arc<EngineMetrics>,
}

impl SessionPool {
    pub fn new(
        client: Arc<dyn StoreClient>,
        timeout: Duration,
        capacity: usize,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            client,
            timeout,
            queue: ArrayQueue::new(capacity.max(1)),
            owned: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Pop a pooled session or allocate a new one.
    pub fn take(&self) -> Arc<dyn StoreSession> {
        if let Some(session) = self.queue.pop() {
            self.metrics.session_taken();
            return session;
        }
        let session = self.client.new_session(self.timeout);
        self.owned.lock().unwrap().push(session.clone());
        self.metrics.session_allocated();
        session
    }

    /// Return a session to the queue. The available gauge only moves when
    /// the push lands; a full queue drops the handle.
    pub fn release(&self, session: Arc<dyn StoreSession>) {
        if self.queue.push(session).is_ok() {
            self.metrics.session_released();
        }
    }
}
