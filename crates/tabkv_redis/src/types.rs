//! Shared types for the batching engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the engine core and the store/transport glue: typed storage
//! requests, the collaborator trait contracts, and the inbound call handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

use crate::operation::Operation;

/// Identifier of a tablet, one partition of the keyspace.
pub type TabletId = String;
/// One client command: the name followed by its arguments, as raw byte strings.
pub type RedisCommand = Vec<Bytes>;

/// Read request kinds understood by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadKind {
    Get,
    MGet,
    HGet,
    TsGet,
    HMGet,
    HGetAll,
    HKeys,
    HVals,
    HLen,
    HExists,
    HStrlen,
    SMembers,
    SIsMember,
    SCard,
    Strlen,
    Exists,
    GetRange,
    ZCard,
    TsRangeByTime,
    ZRangeByScore,
    ZRevRange,
}

/// Write request kinds understood by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    MSet,
    HSet,
    HMSet,
    HDel,
    SAdd,
    SRem,
    TsAdd,
    TsRem,
    ZRem,
    ZAdd,
    GetSet,
    Append,
    Del,
    SetRange,
    Incr,
}

/// Typed read request: the primary key plus any subkeys (hash fields, set
/// members, extra MGET keys) and an optional integer range.
#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub kind: ReadKind,
    pub key: Bytes,
    pub subkeys: Vec<Bytes>,
    pub range: Option<(i64, i64)>,
}

/// Typed write request: the primary key plus the remaining validated arguments.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    pub kind: WriteKind,
    pub key: Bytes,
    pub args: Vec<Bytes>,
}

/// The storage payload of one operation.
#[derive(Clone, Debug)]
pub enum StorageRequest {
    Read(ReadRequest),
    Write(WriteRequest),
}

impl StorageRequest {
    /// Primary key of the request, the source of its partition key.
    pub fn key(&self) -> &Bytes {
        match self {
            StorageRequest::Read(req) => &req.key,
            StorageRequest::Write(req) => &req.key,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, StorageRequest::Read(_))
    }
}

/// Sink for per-index responses of one inbound batch.
///
/// The transport owns the response slots; the engine guarantees it calls
/// `respond` at most once per index.
pub trait ResponseSink: Send + Sync + 'static {
    fn respond(&self, index: usize, frame: BytesFrame);

    /// True once the client connection dropped; operations applied afterwards
    /// fail with an aborted error instead of touching storage.
    fn is_aborted(&self) -> bool {
        false
    }

    /// Ask the transport to close the connection after pending responses drain.
    fn mark_for_close(&self) {}
}

/// One inbound batch of pipelined commands plus its response sink.
pub struct BatchCall {
    commands: Vec<RedisCommand>,
    sink: Arc<dyn ResponseSink>,
    payload_bytes: usize,
    received_at: Instant,
}

impl BatchCall {
    pub fn new(commands: Vec<RedisCommand>, sink: Arc<dyn ResponseSink>) -> Self {
        let payload_bytes = commands
            .iter()
            .map(|cmd| cmd.iter().map(Bytes::len).sum::<usize>())
            .sum();
        Self {
            commands,
            sink,
            payload_bytes,
            received_at: Instant::now(),
        }
    }

    pub fn commands(&self) -> &[RedisCommand] {
        &self.commands
    }

    /// Total argument bytes across the batch, checked against the command
    /// size limit.
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    pub fn respond(&self, index: usize, frame: BytesFrame) {
        self.sink.respond(index, frame);
    }

    pub fn is_aborted(&self) -> bool {
        self.sink.is_aborted()
    }

    pub fn mark_for_close(&self) {
        self.sink.mark_for_close();
    }

    /// Microseconds since the batch arrived, recorded into per-command stats
    /// at respond time.
    pub fn elapsed_us(&self) -> u64 {
        self.received_at.elapsed().as_micros() as u64
    }
}

/// Lazy bootstrap of the store connection, invoked on the first batch and
/// retried on the next batch after a failure.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<Arc<dyn StoreClient>>;
}

/// Client half of the storage collaborator: routing and session construction.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Derive the partition key bytes for a primary key.
    fn partition_key(&self, primary_key: &[u8]) -> anyhow::Result<Bytes>;

    /// Resolve the tablet currently owning `partition_key`.
    async fn lookup_tablet(
        &self,
        partition_key: &[u8],
        deadline: Instant,
    ) -> anyhow::Result<TabletId>;

    /// Construct a manual-flush session with the given operation timeout.
    fn new_session(&self, timeout: Duration) -> Arc<dyn StoreSession>;

    /// Drop all rows; backs FLUSHDB/FLUSHALL.
    async fn truncate_table(&self) -> anyhow::Result<()>;
}

/// A buffering storage session. `apply` queues an operation; `flush` submits
/// everything queued and fills each operation's response slot.
#[async_trait]
pub trait StoreSession: Send + Sync + 'static {
    fn apply(&self, op: Arc<Operation>) -> anyhow::Result<()>;

    async fn flush(&self) -> anyhow::Result<()>;

    fn has_pending_operations(&self) -> bool;

    /// Per-operation errors collected by the last flush, for diagnostics.
    fn pending_errors(&self) -> Vec<anyhow::Error> {
        Vec::new()
    }

    /// Hint that the flush may run storage calls inline on the current
    /// worker instead of handing off.
    fn set_allow_local_calls(&self, _allow: bool) {}
}
