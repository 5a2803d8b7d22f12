//! Engine counters: per-command latency/error stats, internal flush latency
//! per side, and session pool gauges.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-operation stats counters.
#[derive(Default)]
pub struct OpStats {
    count: AtomicU64,
    errors: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl OpStats {
    /// Record a single operation's latency and success/failure.
    pub fn record(&self, dur_us: u64, ok: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(dur_us, Ordering::Relaxed);
        self.max_us.fetch_max(dur_us, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot counters without resetting them.
    pub fn peek(&self) -> OpStatsSnapshot {
        OpStatsSnapshot {
            count: self.count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_us: self.total_us.load(Ordering::Relaxed),
            max_us: self.max_us.load(Ordering::Relaxed),
        }
    }
}

/// Isolated copy of one `OpStats`.
#[derive(Default, Debug, Clone)]
pub struct OpStatsSnapshot {
    pub count: u64,
    pub errors: u64,
    pub total_us: u64,
    pub max_us: u64,
}

/// Counter registry shared by the service, operations, blocks, and the
/// session pool. One `OpStats` per dispatch-table entry, a write/read pair
/// for block flush latency, and the pool gauges.
pub struct EngineMetrics {
    command_names: Box<[&'static str]>,
    commands: Box<[OpStats]>,
    flush: [OpStats; 2],
    sessions_allocated: AtomicU64,
    sessions_available: AtomicU64,
}

impl EngineMetrics {
    pub fn new(command_names: Vec<&'static str>) -> Self {
        let commands = command_names
            .iter()
            .map(|_| OpStats::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            command_names: command_names.into_boxed_slice(),
            commands,
            flush: [OpStats::default(), OpStats::default()],
            sessions_allocated: AtomicU64::new(0),
            sessions_available: AtomicU64::new(0),
        }
    }

    /// Record one command's respond-time latency into its table slot.
    pub fn record_command(&self, slot: usize, dur_us: u64, ok: bool) {
        if let Some(stats) = self.commands.get(slot) {
            stats.record(dur_us, ok);
        }
    }

    /// Record one block flush, keyed by the block's side.
    pub fn record_flush(&self, read: bool, dur_us: u64, ok: bool) {
        self.flush[usize::from(read)].record(dur_us, ok);
    }

    pub(crate) fn session_allocated(&self) {
        self.sessions_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_taken(&self) {
        self.sessions_available.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn session_released(&self) {
        self.sessions_available.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        let commands = self
            .command_names
            .iter()
            .zip(self.commands.iter())
            .map(|(name, stats)| (*name, stats.peek()))
            .collect();
        EngineMetricsSnapshot {
            commands,
            write_flush: self.flush[0].peek(),
            read_flush: self.flush[1].peek(),
            sessions_allocated: self.sessions_allocated.load(Ordering::Relaxed),
            sessions_available: self.sessions_available.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of all engine counters.
#[derive(Default, Debug, Clone)]
pub struct EngineMetricsSnapshot {
    pub commands: Vec<(&'static str, OpStatsSnapshot)>,
    pub write_flush: OpStatsSnapshot,
    pub read_flush: OpStatsSnapshot,
    pub sessions_allocated: u64,
    pub sessions_available: u64,
}

impl EngineMetricsSnapshot {
    /// Stats row for one command name, if the table knows it.
    pub fn command(&self, name: &str) -> Option<&OpStatsSnapshot> {
        self.commands
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, stats)| stats)
    }
}
