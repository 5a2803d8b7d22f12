//! Per-tablet grouping of a batch's operations into flush-ordered blocks.
//!
//! Reads and writes accumulate in one block per side and flush in parallel
//! until a key appears on both sides. The first such conflict freezes the
//! order: the side touched earlier becomes the flush head and the other
//! side's block is chained behind it. Every later flip of the conflict side
//! appends another link to the chain.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::block::Block;
use crate::metrics::EngineMetrics;
use crate::operation::Operation;
use crate::session_pool::SessionPool;

/// Which side the most recent conflict landed on. `NoneYet` means the
/// tablet has not seen a read/write collision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LastConflict {
    NoneYet,
    OnRead,
    OnWrite,
}

impl LastConflict {
    fn matches(self, read: bool) -> bool {
        match self {
            LastConflict::NoneYet => false,
            LastConflict::OnRead => read,
            LastConflict::OnWrite => !read,
        }
    }
}

#[derive(Default)]
struct SideData {
    used_keys: HashSet<Bytes>,
    block: Option<Arc<Block>>,
}

pub(crate) struct TabletOperations {
    read_data: SideData,
    write_data: SideData,
    flush_head: Option<Arc<Block>>,
    last_conflict: LastConflict,
}

impl TabletOperations {
    pub(crate) fn new() -> Self {
        Self {
            read_data: SideData::default(),
            write_data: SideData::default(),
            flush_head: None,
            last_conflict: LastConflict::NoneYet,
        }
    }

    fn side(&self, read: bool) -> &SideData {
        if read {
            &self.read_data
        } else {
            &self.write_data
        }
    }

    fn side_mut(&mut self, read: bool) -> &mut SideData {
        if read {
            &mut self.read_data
        } else {
            &mut self.write_data
        }
    }

    /// Place one operation into its side's current block, detecting
    /// conflicts first. With `safe_batch` off no keys are tracked and the
    /// sides never order against each other.
    pub(crate) fn process(
        &mut self,
        op: Arc<Operation>,
        metrics: &Arc<EngineMetrics>,
        safe_batch: bool,
    ) {
        let read = op.read();
        let key = if safe_batch {
            op.conflict_key().cloned()
        } else {
            None
        };
        self.check_conflicts(read, key.as_ref());

        if self.side(read).block.is_none() {
            let block = Block::new(read, metrics.clone());
            if self.last_conflict.matches(read) {
                if let Some(other) = self.side(!read).block.clone() {
                    if other.set_next(Some(block.clone())).is_some() {
                        tracing::warn!("conflicting block already had a successor");
                    }
                }
            }
            self.side_mut(read).block = Some(block);
        }

        let data = self.side_mut(read);
        if let Some(block) = &data.block {
            block.push(op);
        }
        if let Some(key) = key {
            data.used_keys.insert(key);
        }
    }

    /// Launch this tablet's blocks. A conflicted tablet starts from the
    /// flush head and the chain carries the rest; otherwise both sides
    /// flush in parallel.
    pub(crate) fn done(self, pool: &Arc<SessionPool>, allow_local: bool) {
        if let Some(flush_head) = self.flush_head {
            flush_head.launch(pool, allow_local);
            return;
        }
        if let Some(block) = self.read_data.block {
            block.launch(pool, allow_local);
        }
        if let Some(block) = self.write_data.block {
            block.launch(pool, allow_local);
        }
    }

    fn check_conflicts(&mut self, read: bool, key: Option<&Bytes>) {
        // A side that already owns the latest conflict is ordered behind
        // the other side, nothing further to detect.
        if self.last_conflict.matches(read) {
            return;
        }
        let Some(key) = key else {
            return;
        };
        if self.side(!read).used_keys.contains(key) {
            self.conflict_found(read);
        }
    }

    fn conflict_found(&mut self, read: bool) {
        match self.last_conflict {
            LastConflict::NoneYet => {
                let this_block = self.side(read).block.clone();
                let other_block = self.side(!read).block.clone();
                self.flush_head = other_block.clone();
                if let Some(other) = &other_block {
                    other.set_next(this_block);
                }
            }
            LastConflict::OnRead | LastConflict::OnWrite => {
                // The conflict side flipped. Drop this side's current
                // grouping so the next op opens a fresh block chained
                // behind the opposite side.
                let data = self.side_mut(read);
                data.block = None;
                data.used_keys.clear();
            }
        }
        self.last_conflict = if read {
            LastConflict::OnRead
        } else {
            LastConflict::OnWrite
        };
    }
}
