//! Shared helpers for integration tests: an in-memory mock store behind the
//! engine's client traits, and a response sink that records frames.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tabkv_redis::{
    BatchCall, Operation, ReadKind, RedisService, ResponseSink, StorageRequest, StoreClient,
    StoreConnector, StoreSession, TabletId, WriteKind,
};

/// Install the log subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Sink that records every `(index, frame)` pair in arrival order.
pub struct RecordingSink {
    frames: Mutex<Vec<(usize, BytesFrame)>>,
    aborted: AtomicBool,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Arrival order of batch indexes.
    pub fn order(&self) -> Vec<usize> {
        self.frames.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }

    /// Frame recorded for one batch index.
    pub fn frame(&self, index: usize) -> BytesFrame {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, frame)| frame.clone())
            .unwrap_or_else(|| panic!("no response recorded for index {index}"))
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Poll until `want` responses arrived, panicking after two seconds.
    pub async fn wait_for(&self, want: usize) {
        for _ in 0..400 {
            if self.len() >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {want} responses, have {}", self.len());
    }
}

impl ResponseSink for RecordingSink {
    fn respond(&self, index: usize, frame: BytesFrame) {
        self.frames.lock().unwrap().push((index, frame));
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn mark_for_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Backing state shared by every session a [`MockClient`] creates.
#[derive(Default)]
pub struct StoreState {
    data: Mutex<HashMap<Bytes, Bytes>>,
    /// Operation indexes per session flush, in flush order.
    flushes: Mutex<Vec<Vec<usize>>>,
    fail_flush: AtomicBool,
}

/// In-memory store client with per-key tablet routing.
pub struct MockClient {
    state: Arc<StoreState>,
    routes: HashMap<Bytes, TabletId>,
    lookup_failures: Mutex<HashSet<Bytes>>,
    sessions_created: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Self::with_routes(&[])
    }

    /// Route specific keys to named tablets; everything else lands on
    /// `tablet-0`.
    pub fn with_routes(routes: &[(&[u8], &str)]) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(StoreState::default()),
            routes: routes
                .iter()
                .map(|(key, tablet)| (Bytes::copy_from_slice(key), tablet.to_string()))
                .collect(),
            lookup_failures: Mutex::new(HashSet::new()),
            sessions_created: AtomicUsize::new(0),
        })
    }

    pub fn fail_lookup_for(&self, key: &[u8]) {
        self.lookup_failures
            .lock()
            .unwrap()
            .insert(Bytes::copy_from_slice(key));
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.state.fail_flush.store(fail, Ordering::SeqCst);
    }

    pub fn seed(&self, key: &[u8], value: &[u8]) {
        self.state.data.lock().unwrap().insert(
            Bytes::copy_from_slice(key),
            Bytes::copy_from_slice(value),
        );
    }

    pub fn value(&self, key: &[u8]) -> Option<Bytes> {
        self.state.data.lock().unwrap().get(key).cloned()
    }

    pub fn flushes(&self) -> Vec<Vec<usize>> {
        self.state.flushes.lock().unwrap().clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreClient for MockClient {
    fn partition_key(&self, primary_key: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(primary_key))
    }

    async fn lookup_tablet(
        &self,
        partition_key: &[u8],
        _deadline: Instant,
    ) -> anyhow::Result<TabletId> {
        if self.lookup_failures.lock().unwrap().contains(partition_key) {
            anyhow::bail!("tablet lookup failed");
        }
        Ok(self
            .routes
            .get(partition_key)
            .cloned()
            .unwrap_or_else(|| "tablet-0".to_string()))
    }

    fn new_session(&self, _timeout: Duration) -> Arc<dyn StoreSession> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(MockSession {
            state: self.state.clone(),
            pending: Mutex::new(Vec::new()),
        })
    }

    async fn truncate_table(&self) -> anyhow::Result<()> {
        self.state.data.lock().unwrap().clear();
        Ok(())
    }
}

/// Connector that optionally refuses the first few connection attempts.
pub struct MockConnector {
    client: Arc<MockClient>,
    failures_left: AtomicUsize,
}

impl MockConnector {
    pub fn new(client: Arc<MockClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            failures_left: AtomicUsize::new(0),
        })
    }

    pub fn failing_first(client: Arc<MockClient>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            client,
            failures_left: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl StoreConnector for MockConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn StoreClient>> {
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("store unreachable");
        }
        Ok(self.client.clone())
    }
}

struct MockSession {
    state: Arc<StoreState>,
    pending: Mutex<Vec<Arc<Operation>>>,
}

impl MockSession {
    fn execute(&self, op: &Arc<Operation>) -> BytesFrame {
        let Some(request) = op.storage_request() else {
            return BytesFrame::Null;
        };
        match request {
            StorageRequest::Write(write) => {
                let mut data = self.state.data.lock().unwrap();
                match write.kind {
                    WriteKind::Set => {
                        data.insert(
                            write.key.clone(),
                            write.args.first().cloned().unwrap_or_default(),
                        );
                        BytesFrame::SimpleString(Bytes::from_static(b"OK"))
                    }
                    WriteKind::Del => {
                        let removed = data.remove(&write.key).is_some();
                        BytesFrame::Integer(removed as i64)
                    }
                    _ => BytesFrame::SimpleString(Bytes::from_static(b"OK")),
                }
            }
            StorageRequest::Read(read) => {
                let data = self.state.data.lock().unwrap();
                match read.kind {
                    ReadKind::Get => match data.get(&read.key) {
                        Some(value) => BytesFrame::BulkString(value.clone()),
                        None => BytesFrame::Null,
                    },
                    ReadKind::Exists => BytesFrame::Integer(data.contains_key(&read.key) as i64),
                    _ => BytesFrame::Null,
                }
            }
        }
    }
}

#[async_trait]
impl StoreSession for MockSession {
    fn apply(&self, op: Arc<Operation>) -> anyhow::Result<()> {
        self.pending.lock().unwrap().push(op);
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        if self.state.fail_flush.load(Ordering::SeqCst) {
            anyhow::bail!("tablet flush failed");
        }
        let indexes: Vec<usize> = pending.iter().map(|op| op.index()).collect();
        self.state.flushes.lock().unwrap().push(indexes);
        for op in &pending {
            op.set_response(self.execute(op));
        }
        Ok(())
    }

    fn has_pending_operations(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }
}

/// Build one command from string parts.
pub fn cmd(parts: &[&str]) -> Vec<Bytes> {
    parts
        .iter()
        .map(|part| Bytes::copy_from_slice(part.as_bytes()))
        .collect()
}

/// Run one batch against the service and wait until every command slot has
/// responded.
pub async fn run_batch(service: &RedisService, commands: Vec<Vec<Bytes>>) -> Arc<RecordingSink> {
    let sink = RecordingSink::new();
    let want = commands.len();
    let call = BatchCall::new(commands, sink.clone());
    service.handle(call).await;
    sink.wait_for(want).await;
    sink
}

pub fn assert_ok(frame: &BytesFrame) {
    assert!(
        matches!(frame, BytesFrame::SimpleString(s) if s.as_ref() == b"OK"),
        "expected +OK, got {frame:?}"
    );
}

pub fn assert_bulk(frame: &BytesFrame, expected: &[u8]) {
    match frame {
        BytesFrame::BulkString(data) => assert_eq!(data.as_ref(), expected),
        other => panic!("expected bulk string, got {other:?}"),
    }
}

pub fn assert_null(frame: &BytesFrame) {
    assert!(matches!(frame, BytesFrame::Null), "expected null, got {frame:?}");
}

/// Error payload text, panicking when the frame is not an error.
pub fn error_text(frame: &BytesFrame) -> String {
    match frame {
        BytesFrame::Error(message) => message.to_string(),
        other => panic!("expected error frame, got {other:?}"),
    }
}
