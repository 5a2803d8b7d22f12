//! Batch entry point and engine configuration.
//!
//! `RedisService` owns the dispatch table, the metrics registry, and the
//! lazily connected store client. Each inbound batch is parsed into a
//! `BatchContext`; local commands answer inline and the rest commit
//! through tablet lookup and block distribution.

use std::sync::Arc;
use std::time::Duration;
use std::{env, str::FromStr};

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use tokio::sync::OnceCell;

use crate::batch::BatchContext;
use crate::commands::{
    build_read, build_write, parse_sleep_ms, CommandEntry, CommandHandler, CommandTable,
    LocalCommand,
};
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::operation::DeferredExecutor;
use crate::session_pool::SessionPool;
use crate::types::{BatchCall, StorageRequest, StoreClient, StoreConnector};

const DEFAULT_MAX_COMMAND_SIZE: usize = 253 * 1024 * 1024;
const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SESSION_POOL_CAPACITY: usize = 30;

const INFO_RESPONSE: &[u8] = b"# Server\r\n\
redis_version:4.0.0\r\n\
redis_mode:standalone\r\n\
\r\n\
# Replication\r\n\
role:master\r\n\
connected_slaves:0\r\n";

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on the combined payload of one inbound batch.
    pub max_command_size: usize,
    /// Upper bound on a single command argument.
    pub max_value_size: usize,
    /// Deadline for tablet lookups, also the session operation timeout.
    pub client_timeout: Duration,
    /// Order conflicting reads and writes inside a batch.
    pub safe_batch: bool,
    /// Sessions kept warm for reuse.
    pub session_pool_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            client_timeout: Duration::from_millis(DEFAULT_CLIENT_TIMEOUT_MS),
            safe_batch: true,
            session_pool_capacity: DEFAULT_SESSION_POOL_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TABKV_REDIS_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_command_size: read_env_usize(
                "TABKV_REDIS_MAX_COMMAND_SIZE",
                defaults.max_command_size,
            ),
            max_value_size: read_env_usize("TABKV_REDIS_MAX_VALUE_SIZE", defaults.max_value_size),
            client_timeout: Duration::from_millis(read_env_u64(
                "TABKV_REDIS_CLIENT_TIMEOUT_MS",
                DEFAULT_CLIENT_TIMEOUT_MS,
            )),
            safe_batch: read_env_bool("TABKV_REDIS_SAFE_BATCH", defaults.safe_batch),
            session_pool_capacity: read_env_usize(
                "TABKV_REDIS_SESSION_POOL_SIZE",
                defaults.session_pool_capacity,
            ),
        }
    }
}

#[derive(Clone)]
struct EngineState {
    client: Arc<dyn StoreClient>,
    pool: Arc<SessionPool>,
}

pub struct RedisService {
    config: EngineConfig,
    table: CommandTable,
    metrics: Arc<EngineMetrics>,
    connector: Arc<dyn StoreConnector>,
    state: OnceCell<EngineState>,
}

impl RedisService {
    pub fn new(config: EngineConfig, connector: Arc<dyn StoreConnector>) -> Self {
        let table = CommandTable::new();
        let metrics = Arc::new(EngineMetrics::new(table.names()));
        Self {
            config,
            table,
            metrics,
            connector,
            state: OnceCell::new(),
        }
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Process one inbound batch. Every command slot receives exactly one
    /// response through the call's sink.
    pub async fn handle(&self, call: BatchCall) {
        let call = Arc::new(call);
        if call.payload_bytes() > self.config.max_command_size {
            let msg = format!(
                "ERR Command of size {} exceeded the limit {}",
                call.payload_bytes(),
                self.config.max_command_size
            );
            for index in 0..call.commands().len() {
                call.respond(index, BytesFrame::Error(msg.clone().into()));
            }
            return;
        }

        let state = match self.state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(error = ?err, "store bootstrap failed, failing whole batch");
                let msg = format!("ERR Could not open the key-value store: {err:#}");
                for index in 0..call.commands().len() {
                    call.respond(index, BytesFrame::Error(msg.clone().into()));
                }
                return;
            }
        };

        let context = BatchContext::new(
            call.clone(),
            state.client.clone(),
            state.pool.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );
        for index in 0..call.commands().len() {
            self.process_command(&call, &context, &state, index).await;
        }
        context.commit();
    }

    /// Connect to the store on first use. A failed attempt is not cached,
    /// the next batch retries.
    async fn state(&self) -> anyhow::Result<EngineState> {
        let state = self
            .state
            .get_or_try_init(|| async {
                let client = self.connector.connect().await?;
                let pool = Arc::new(SessionPool::new(
                    client.clone(),
                    self.config.client_timeout,
                    self.config.session_pool_capacity,
                    self.metrics.clone(),
                ));
                Ok::<_, anyhow::Error>(EngineState { client, pool })
            })
            .await?;
        Ok(state.clone())
    }

    async fn process_command(
        &self,
        call: &Arc<BatchCall>,
        context: &Arc<BatchContext>,
        state: &EngineState,
        index: usize,
    ) {
        let command = &call.commands()[index];
        let Some(name) = command.first() else {
            respond_failure(call, index, b"", "Unsupported call.");
            return;
        };
        let Some(entry) = self.table.lookup(name) else {
            respond_failure(call, index, name, "Unsupported call.");
            return;
        };
        if let Err(msg) = entry.check_arity(command.len()) {
            self.fail_command(call, index, entry, msg);
            return;
        }
        if command[1..]
            .iter()
            .any(|arg| arg.len() > self.config.max_value_size)
        {
            self.fail_command(call, index, entry, "Redis argument too long.");
            return;
        }
        match entry.handler {
            CommandHandler::Read(kind) => match build_read(kind, &command[1..]) {
                Ok(request) => {
                    context.apply_storage(index, entry.slot, StorageRequest::Read(request))
                }
                Err(err) => self.fail_command(call, index, entry, &err.to_string()),
            },
            CommandHandler::Write(kind) => match build_write(kind, &command[1..]) {
                Ok(request) => {
                    context.apply_storage(index, entry.slot, StorageRequest::Write(request))
                }
                Err(err) => self.fail_command(call, index, entry, &err.to_string()),
            },
            CommandHandler::Local(local) => {
                self.run_local(call, context, state, index, entry, local).await;
            }
        }
    }

    /// Commands answered without storage requests. DEBUGSLEEP is the
    /// exception: it joins the batch as a deferred operation so its
    /// response obeys batch completion.
    async fn run_local(
        &self,
        call: &Arc<BatchCall>,
        context: &Arc<BatchContext>,
        state: &EngineState,
        index: usize,
        entry: &CommandEntry,
        local: LocalCommand,
    ) {
        let command = &call.commands()[index];
        let frame = match local {
            LocalCommand::Echo => BytesFrame::BulkString(command[1].clone()),
            LocalCommand::Ping => match command.get(1) {
                Some(msg) => BytesFrame::BulkString(msg.clone()),
                None => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
            },
            LocalCommand::Auth | LocalCommand::Config | LocalCommand::CommandList => {
                BytesFrame::SimpleString(Bytes::from_static(b"OK"))
            }
            LocalCommand::Info => BytesFrame::BulkString(Bytes::from_static(INFO_RESPONSE)),
            LocalCommand::Role => BytesFrame::Array(vec![
                BytesFrame::BulkString(Bytes::from_static(b"master")),
                BytesFrame::Integer(0),
                BytesFrame::Array(Vec::new()),
            ]),
            LocalCommand::Quit => {
                call.mark_for_close();
                BytesFrame::SimpleString(Bytes::from_static(b"OK"))
            }
            LocalCommand::FlushDb | LocalCommand::FlushAll => {
                match state.client.truncate_table().await {
                    Ok(()) => BytesFrame::SimpleString(Bytes::from_static(b"OK")),
                    Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
                }
            }
            LocalCommand::DebugSleep => {
                match parse_sleep_ms(&command[1]) {
                    Ok(ms) => {
                        let delay = Duration::from_millis(ms);
                        let executor: DeferredExecutor = Box::new(move |callback| {
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                callback(Ok(()));
                            });
                            true
                        });
                        context.apply_deferred(index, entry.slot, executor, Bytes::new());
                    }
                    Err(err) => self.fail_command(call, index, entry, &err.to_string()),
                }
                return;
            }
        };
        let ok = !matches!(frame, BytesFrame::Error(_));
        self.metrics.record_command(entry.slot, call.elapsed_us(), ok);
        call.respond(index, frame);
    }

    fn fail_command(&self, call: &Arc<BatchCall>, index: usize, entry: &CommandEntry, msg: &str) {
        self.metrics
            .record_command(entry.slot, call.elapsed_us(), false);
        respond_failure(call, index, entry.name.as_bytes(), msg);
    }
}

fn respond_failure(call: &Arc<BatchCall>, index: usize, name: &[u8], msg: &str) {
    let name = String::from_utf8_lossy(name);
    call.respond(index, BytesFrame::Error(format!("ERR {name}: {msg}").into()));
}

/// Read an env var as u64 with a default.
fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

/// Read an env var as bool with a default, accepting common truthy values.
fn read_env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| {
            matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_reads_env_overrides() {
        env::set_var("TABKV_REDIS_MAX_VALUE_SIZE", "1024");
        env::set_var("TABKV_REDIS_SAFE_BATCH", "off");
        env::set_var("TABKV_REDIS_CLIENT_TIMEOUT_MS", "2500");
        let config = EngineConfig::from_env();
        env::remove_var("TABKV_REDIS_MAX_VALUE_SIZE");
        env::remove_var("TABKV_REDIS_SAFE_BATCH");
        env::remove_var("TABKV_REDIS_CLIENT_TIMEOUT_MS");

        assert_eq!(config.max_value_size, 1024);
        assert!(!config.safe_batch);
        assert_eq!(config.client_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_command_size, DEFAULT_MAX_COMMAND_SIZE);
        assert_eq!(config.session_pool_capacity, DEFAULT_SESSION_POOL_CAPACITY);
    }
}
