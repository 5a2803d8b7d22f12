//! Batch lifecycle from parsed operations to per-tablet launch.
//!
//! A context owns every operation parsed from one inbound batch. Commit
//! fans out one tablet lookup per live operation; the task that completes
//! the final lookup runs distribution, which groups operations per tablet
//! and launches the flush blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use crate::metrics::EngineMetrics;
use crate::operation::{DeferredExecutor, Operation};
use crate::service::EngineConfig;
use crate::session_pool::SessionPool;
use crate::tablet_ops::TabletOperations;
use crate::types::{BatchCall, StorageRequest, StoreClient, TabletId};

pub(crate) struct BatchContext {
    call: Arc<BatchCall>,
    client: Arc<dyn StoreClient>,
    pool: Arc<SessionPool>,
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    operations: Mutex<Vec<Arc<Operation>>>,
    lookups_left: AtomicUsize,
}

impl BatchContext {
    pub(crate) fn new(
        call: Arc<BatchCall>,
        client: Arc<dyn StoreClient>,
        pool: Arc<SessionPool>,
        config: EngineConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            call,
            client,
            pool,
            config,
            metrics,
            operations: Mutex::new(Vec::new()),
            lookups_left: AtomicUsize::new(0),
        })
    }

    /// Queue a storage-backed operation. A partition key failure answers
    /// the slot immediately but the operation is still tracked.
    pub(crate) fn apply_storage(&self, index: usize, slot: usize, request: StorageRequest) {
        let op = match self.client.partition_key(request.key()) {
            Ok(partition_key) => Operation::storage(
                self.call.clone(),
                index,
                slot,
                request,
                partition_key,
                self.metrics.clone(),
            ),
            Err(err) => {
                let op = Operation::storage(
                    self.call.clone(),
                    index,
                    slot,
                    request,
                    Bytes::new(),
                    self.metrics.clone(),
                );
                op.fail(&err);
                op
            }
        };
        self.operations.lock().unwrap().push(op);
    }

    /// Queue a deferred operation under the given partition key.
    pub(crate) fn apply_deferred(
        &self,
        index: usize,
        slot: usize,
        executor: DeferredExecutor,
        partition_key: Bytes,
    ) {
        let op = Operation::deferred(
            self.call.clone(),
            index,
            slot,
            executor,
            partition_key,
            self.metrics.clone(),
        );
        self.operations.lock().unwrap().push(op);
    }

    /// Fan out a tablet lookup per unanswered operation. The task that
    /// finishes the last lookup distributes the whole batch.
    pub(crate) fn commit(self: &Arc<Self>) {
        let ops: Vec<_> = self
            .operations
            .lock()
            .unwrap()
            .iter()
            .filter(|op| !op.responded())
            .cloned()
            .collect();
        if ops.is_empty() {
            return;
        }
        self.lookups_left.store(ops.len(), Ordering::Release);
        let deadline = Instant::now() + self.config.client_timeout;
        for op in ops {
            let context = self.clone();
            tokio::spawn(async move {
                let result = context
                    .client
                    .lookup_tablet(op.partition_key(), deadline)
                    .await;
                context.lookup_done(op, result);
            });
        }
    }

    fn lookup_done(&self, op: Arc<Operation>, result: anyhow::Result<TabletId>) {
        match result {
            Ok(tablet) => op.set_tablet(tablet),
            Err(err) => op.fail(&err),
        }
        if self.lookups_left.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.distribute();
        }
    }

    /// Group operations by tablet in batch order and launch every tablet's
    /// blocks. Only the last tablet may run local calls on this thread.
    fn distribute(&self) {
        let ops = self.operations.lock().unwrap().clone();
        let mut tablets: HashMap<TabletId, TabletOperations> = HashMap::new();
        for op in ops {
            if op.responded() {
                continue;
            }
            let Some(tablet) = op.tablet() else {
                continue;
            };
            tablets
                .entry(tablet)
                .or_insert_with(TabletOperations::new)
                .process(op, &self.metrics, self.config.safe_batch);
        }
        let total = tablets.len();
        for (i, (_, tablet_ops)) in tablets.into_iter().enumerate() {
            tablet_ops.done(&self.pool, i + 1 == total);
        }
    }
}
