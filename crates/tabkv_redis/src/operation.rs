//! One command inside a batch.
//!
//! An operation either carries a typed storage request that a session will
//! apply and flush, or a deferred executor that signals its completion
//! callback on its own schedule. Each operation responds to its slot in the
//! batch exactly once, whichever path gets there first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

use crate::metrics::EngineMetrics;
use crate::types::{BatchCall, StorageRequest, StoreSession, TabletId};

/// Completion callback handed to sessions and deferred executors.
pub type StatusCallback = Arc<dyn Fn(anyhow::Result<()>) + Send + Sync>;

/// Self-scheduling command body. Returns true when the callback is armed
/// and will fire later.
pub type DeferredExecutor = Box<dyn Fn(StatusCallback) -> bool + Send + Sync>;

enum Payload {
    Storage(StorageRequest),
    Deferred(DeferredExecutor),
}

pub struct Operation {
    index: usize,
    read: bool,
    payload: Payload,
    partition_key: Bytes,
    call: Arc<BatchCall>,
    slot: usize,
    metrics: Arc<EngineMetrics>,
    tablet: Mutex<Option<TabletId>>,
    response: Mutex<Option<BytesFrame>>,
    responded: AtomicBool,
}

impl Operation {
    pub(crate) fn storage(
        call: Arc<BatchCall>,
        index: usize,
        slot: usize,
        request: StorageRequest,
        partition_key: Bytes,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let read = request.is_read();
        Arc::new(Self {
            index,
            read,
            payload: Payload::Storage(request),
            partition_key,
            call,
            slot,
            metrics,
            tablet: Mutex::new(None),
            response: Mutex::new(None),
            responded: AtomicBool::new(false),
        })
    }

    /// Deferred operations ride the read side so they never split a write
    /// block.
    pub(crate) fn deferred(
        call: Arc<BatchCall>,
        index: usize,
        slot: usize,
        executor: DeferredExecutor,
        partition_key: Bytes,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            read: true,
            payload: Payload::Deferred(executor),
            partition_key,
            call,
            slot,
            metrics,
            tablet: Mutex::new(None),
            response: Mutex::new(None),
            responded: AtomicBool::new(false),
        })
    }

    /// Position of this command in the originating batch.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn read(&self) -> bool {
        self.read
    }

    /// The typed request, absent for deferred operations.
    pub fn storage_request(&self) -> Option<&StorageRequest> {
        match &self.payload {
            Payload::Storage(request) => Some(request),
            Payload::Deferred(_) => None,
        }
    }

    pub fn responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Stage the success frame a later flush completion will deliver.
    pub fn set_response(&self, frame: BytesFrame) {
        *self.response.lock().unwrap() = Some(frame);
    }

    pub(crate) fn partition_key(&self) -> &Bytes {
        &self.partition_key
    }

    /// Primary key used for read/write conflict detection. Deferred
    /// operations never conflict.
    pub(crate) fn conflict_key(&self) -> Option<&Bytes> {
        self.storage_request().map(|request| request.key())
    }

    pub(crate) fn set_tablet(&self, tablet: TabletId) {
        *self.tablet.lock().unwrap() = Some(tablet);
    }

    pub(crate) fn tablet(&self) -> Option<TabletId> {
        self.tablet.lock().unwrap().clone()
    }

    /// Hand the operation to a session, or fire a deferred executor.
    /// Returns true when the session took it and a flush is owed.
    pub(crate) fn apply(
        self: &Arc<Self>,
        session: &Arc<dyn StoreSession>,
        callback: &StatusCallback,
    ) -> bool {
        if self.call.is_aborted() {
            self.fail(&anyhow::anyhow!("call aborted by client"));
            return false;
        }
        match &self.payload {
            Payload::Deferred(executor) => executor(callback.clone()),
            Payload::Storage(_) => match session.apply(self.clone()) {
                Ok(()) => true,
                Err(err) => {
                    self.fail(&err);
                    false
                }
            },
        }
    }

    /// Deliver the staged response, or Null when the session left none.
    pub(crate) fn succeed(&self) {
        if !self.mark_responded() {
            return;
        }
        let frame = self
            .response
            .lock()
            .unwrap()
            .take()
            .unwrap_or(BytesFrame::Null);
        self.metrics
            .record_command(self.slot, self.call.elapsed_us(), true);
        self.call.respond(self.index, frame);
    }

    pub(crate) fn fail(&self, err: &anyhow::Error) {
        if !self.mark_responded() {
            return;
        }
        self.metrics
            .record_command(self.slot, self.call.elapsed_us(), false);
        self.call
            .respond(self.index, BytesFrame::Error(format!("ERR {err}").into()));
    }

    fn mark_responded(&self) -> bool {
        let won = self
            .responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            tracing::debug!(
                index = self.index,
                "operation already responded, dropping duplicate response"
            );
        }
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::types::{ReadKind, ReadRequest, ResponseSink};

    struct RecordingSink {
        frames: Mutex<Vec<(usize, BytesFrame)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    impl ResponseSink for RecordingSink {
        fn respond(&self, index: usize, frame: BytesFrame) {
            self.frames.lock().unwrap().push((index, frame));
        }
    }

    fn get_request() -> StorageRequest {
        StorageRequest::Read(ReadRequest {
            kind: ReadKind::Get,
            key: Bytes::from_static(b"k"),
            subkeys: Vec::new(),
            range: None,
        })
    }

    fn one_command_call(sink: Arc<RecordingSink>) -> Arc<BatchCall> {
        let commands = vec![vec![Bytes::from_static(b"get"), Bytes::from_static(b"k")]];
        Arc::new(BatchCall::new(commands, sink))
    }

    #[test]
    fn responds_at_most_once() {
        let sink = RecordingSink::new();
        let call = one_command_call(sink.clone());
        let metrics = Arc::new(EngineMetrics::new(vec!["get"]));
        let op = Operation::storage(
            call,
            0,
            0,
            get_request(),
            Bytes::from_static(b"k"),
            metrics.clone(),
        );

        op.set_response(BytesFrame::SimpleString(Bytes::from_static(b"OK")));
        op.succeed();
        op.fail(&anyhow::anyhow!("late failure"));
        op.succeed();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 0);
        assert!(matches!(&frames[0].1, BytesFrame::SimpleString(s) if s.as_ref() == b"OK"));

        let snap = metrics.snapshot();
        let get = snap.command("get").expect("get row");
        assert_eq!(get.count, 1);
        assert_eq!(get.errors, 0);
    }

    #[test]
    fn success_without_staged_response_is_null() {
        let sink = RecordingSink::new();
        let call = one_command_call(sink.clone());
        let metrics = Arc::new(EngineMetrics::new(vec!["get"]));
        let op = Operation::storage(
            call,
            0,
            0,
            get_request(),
            Bytes::from_static(b"k"),
            metrics,
        );

        op.succeed();

        let frames = sink.frames.lock().unwrap();
        assert!(matches!(frames[0].1, BytesFrame::Null));
    }

    #[test]
    fn deferred_apply_invokes_executor() {
        let sink = RecordingSink::new();
        let call = one_command_call(sink.clone());
        let metrics = Arc::new(EngineMetrics::new(vec!["debugsleep"]));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        let executor: DeferredExecutor = Box::new(move |callback| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            callback(Ok(()));
            true
        });
        let op = Operation::deferred(call, 0, 0, executor, Bytes::new(), metrics);

        let session: Arc<dyn StoreSession> = Arc::new(NoopSession);
        let signals = Arc::new(Mutex::new(Vec::new()));
        let signals_in = signals.clone();
        let callback: StatusCallback = Arc::new(move |status| {
            signals_in.lock().unwrap().push(status.is_ok());
        });

        assert!(op.apply(&session, &callback));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*signals.lock().unwrap(), vec![true]);
        assert!(op.read());
        assert!(op.conflict_key().is_none());
    }

    struct NoopSession;

    #[async_trait::async_trait]
    impl StoreSession for NoopSession {
        fn apply(&self, _op: Arc<Operation>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn flush(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn has_pending_operations(&self) -> bool {
            false
        }
    }
}
