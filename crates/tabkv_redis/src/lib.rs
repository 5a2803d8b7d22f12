//! Redis-protocol command batching and conflict ordering for TabKV.
//!
//! `service` checks inbound batches against the dispatch table and answers
//! local commands inline. Storage commands flow through `batch`, which
//! resolves tablets and hands each operation to `tablet_ops` for ordering
//! into chained flush blocks. `types` defines the store and response
//! contracts higher layers implement.

mod batch;
mod block;
mod commands;
mod metrics;
mod operation;
mod service;
mod session_pool;
mod tablet_ops;
mod types;

pub use commands::{
    build_read, build_write, CommandEntry, CommandHandler, CommandTable, LocalCommand,
};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot, OpStats, OpStatsSnapshot};
pub use operation::{DeferredExecutor, Operation, StatusCallback};
pub use service::{EngineConfig, RedisService};
pub use types::{
    BatchCall, ReadKind, ReadRequest, RedisCommand, ResponseSink, StorageRequest, StoreClient,
    StoreConnector, StoreSession, TabletId, WriteKind, WriteRequest,
};
