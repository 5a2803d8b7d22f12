//! A block is a group of same-side operations that flushes as one unit.
//!
//! Launching a block takes a pooled session and applies every operation to
//! it, then flushes asynchronously. Completion responds to every operation
//! and returns the session. If a conflict ordered another block behind this
//! one, completion also launches it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::metrics::EngineMetrics;
use crate::operation::{Operation, StatusCallback};
use crate::session_pool::SessionPool;
use crate::types::StoreSession;

pub(crate) struct Block {
    read: bool,
    created_at: Instant,
    metrics: Arc<EngineMetrics>,
    ops: Mutex<Vec<Arc<Operation>>>,
    next: Mutex<Option<Arc<Block>>>,
    session: Mutex<Option<Arc<dyn StoreSession>>>,
    allow_local: AtomicBool,
    completed: AtomicBool,
}

impl Block {
    pub(crate) fn new(read: bool, metrics: Arc<EngineMetrics>) -> Arc<Self> {
        Arc::new(Self {
            read,
            created_at: Instant::now(),
            metrics,
            ops: Mutex::new(Vec::new()),
            next: Mutex::new(None),
            session: Mutex::new(None),
            allow_local: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        })
    }

    pub(crate) fn read(&self) -> bool {
        self.read
    }

    pub(crate) fn push(&self, op: Arc<Operation>) {
        self.ops.lock().unwrap().push(op);
    }

    /// Chain a successor behind this block. Returns the successor that was
    /// already in place, if any.
    pub(crate) fn set_next(&self, next: Option<Arc<Block>>) -> Option<Arc<Block>> {
        std::mem::replace(&mut *self.next.lock().unwrap(), next)
    }

    /// Take a session from the pool and run every operation. Blocks with
    /// session work flush asynchronously; a block whose operations all
    /// failed or that is empty completes on the spot.
    pub(crate) fn launch(self: &Arc<Self>, pool: &Arc<SessionPool>, allow_local: bool) {
        let session = pool.take();
        *self.session.lock().unwrap() = Some(session.clone());
        self.allow_local.store(allow_local, Ordering::Release);

        let block = self.clone();
        let done_pool = pool.clone();
        let callback: StatusCallback = Arc::new(move |status| block.done(status, &done_pool));

        let ops = self.ops.lock().unwrap().clone();
        let mut applied = false;
        for op in &ops {
            applied |= op.apply(&session, &callback);
        }
        if applied {
            if session.has_pending_operations() {
                // Local-call shortcuts are only safe when nothing is
                // chained behind this flush.
                session.set_allow_local_calls(
                    allow_local && self.next.lock().unwrap().is_none(),
                );
                let flush_session = session.clone();
                tokio::spawn(async move {
                    callback(flush_session.flush().await);
                });
            }
            // Otherwise every applied operation was deferred and its
            // executor signals the callback on its own schedule.
        } else if !self.completed.swap(true, Ordering::AcqRel) {
            self.processed(pool);
        }
    }

    /// Flush or deferred completion. Responds to every operation exactly
    /// once; a second signal is dropped.
    fn done(&self, status: anyhow::Result<()>, pool: &Arc<SessionPool>) {
        if self.completed.swap(true, Ordering::AcqRel) {
            tracing::debug!(read = self.read, "block completion signaled twice");
            return;
        }
        self.metrics.record_flush(
            self.read,
            self.created_at.elapsed().as_micros() as u64,
            status.is_ok(),
        );
        let ops = self.ops.lock().unwrap().clone();
        match status {
            Ok(()) => {
                for op in &ops {
                    op.succeed();
                }
            }
            Err(err) => {
                if let Some(session) = self.session.lock().unwrap().as_ref() {
                    for serr in session.pending_errors() {
                        tracing::warn!(error = ?serr, "session reported pending operation error");
                    }
                }
                for op in &ops {
                    op.fail(&err);
                }
            }
        }
        self.processed(pool);
    }

    #[cfg(test)]
    pub(crate) fn next(&self) -> Option<Arc<Block>> {
        self.next.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn op_indexes(&self) -> Vec<usize> {
        self.ops.lock().unwrap().iter().map(|op| op.index()).collect()
    }

    /// Return the session and hand the conflict chain to the successor.
    fn processed(&self, pool: &Arc<SessionPool>) {
        if let Some(session) = self.session.lock().unwrap().take() {
            pool.release(session);
        }
        if let Some(next) = self.next.lock().unwrap().clone() {
            next.launch(pool, self.allow_local.load(Ordering::Acquire));
        }
    }
}
