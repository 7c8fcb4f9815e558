//! Per-transaction buffering of state deltas.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

use crate::delta::StateDelta;
use crate::types::TransactionId;

/// Buffers incomplete transactions before replication.
///
/// A batch is complete once it ends with a `TransactionCommit` delta; only
/// complete batches ever reach the replicated log, so recovery never sees
/// half a transaction and aborts are free. The buffer is enabled only while
/// the owning server is leader.
///
/// The buffer has its own lock and never calls into the server core while
/// holding it: completed batches are returned to the caller, which appends
/// them under the core lock.
#[derive(Debug, Default)]
pub struct LogEntryBuffer {
    inner: Mutex<BufferInner>,
}

#[derive(Debug, Default)]
struct BufferInner {
    enabled: bool,
    batches: HashMap<TransactionId, Vec<StateDelta>>,
}

impl LogEntryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept inserts. Called on becoming leader.
    pub fn enable(&self) {
        self.inner.lock().enabled = true;
    }

    /// Drop all buffered batches and refuse further inserts. Called on any
    /// transition out of leader.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        inner.batches.clear();
    }

    /// Insert a delta into its transaction's batch.
    ///
    /// Returns the completed batch when `delta` commits its transaction; the
    /// caller hands it to the server for log append. Aborts discard the
    /// batch; all other kinds accumulate.
    pub fn emplace(&self, delta: StateDelta) -> Option<(TransactionId, Vec<StateDelta>)> {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return None;
        }

        let tx_id = delta.tx_id();
        if delta.is_abort() {
            trace!(tx_id, "discarding aborted transaction batch");
            inner.batches.remove(&tx_id);
            return None;
        }

        let batch = inner.batches.entry(tx_id).or_default();
        let complete = delta.is_commit();
        batch.push(delta);

        if complete {
            inner.batches.remove(&tx_id).map(|batch| (tx_id, batch))
        } else {
            None
        }
    }

    /// Check if no batches are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_buffer_drops_deltas() {
        let buffer = LogEntryBuffer::new();

        assert!(buffer
            .emplace(StateDelta::TransactionBegin { tx_id: 1 })
            .is_none());
        assert!(buffer
            .emplace(StateDelta::TransactionCommit { tx_id: 1 })
            .is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_commit_flushes_whole_batch() {
        let buffer = LogEntryBuffer::new();
        buffer.enable();

        assert!(buffer
            .emplace(StateDelta::TransactionBegin { tx_id: 42 })
            .is_none());
        assert!(buffer
            .emplace(StateDelta::CreateVertex { tx_id: 42, gid: 1 })
            .is_none());

        let (tx_id, batch) = buffer
            .emplace(StateDelta::TransactionCommit { tx_id: 42 })
            .unwrap();
        assert_eq!(tx_id, 42);
        assert_eq!(batch.len(), 3);
        assert!(batch[2].is_commit());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_abort_discards_batch() {
        let buffer = LogEntryBuffer::new();
        buffer.enable();

        buffer.emplace(StateDelta::TransactionBegin { tx_id: 7 });
        buffer.emplace(StateDelta::CreateVertex { tx_id: 7, gid: 1 });
        assert!(buffer
            .emplace(StateDelta::TransactionAbort { tx_id: 7 })
            .is_none());
        assert!(buffer.is_empty());

        // A commit after the abort starts a fresh batch with only itself.
        let (_, batch) = buffer
            .emplace(StateDelta::TransactionCommit { tx_id: 7 })
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_interleaved_transactions_stay_separate() {
        let buffer = LogEntryBuffer::new();
        buffer.enable();

        buffer.emplace(StateDelta::TransactionBegin { tx_id: 1 });
        buffer.emplace(StateDelta::TransactionBegin { tx_id: 2 });
        buffer.emplace(StateDelta::CreateVertex { tx_id: 2, gid: 9 });

        let (tx_id, batch) = buffer
            .emplace(StateDelta::TransactionCommit { tx_id: 1 })
            .unwrap();
        assert_eq!(tx_id, 1);
        assert_eq!(batch.len(), 2);
        assert!(!buffer.is_empty());

        let (tx_id, batch) = buffer
            .emplace(StateDelta::TransactionCommit { tx_id: 2 })
            .unwrap();
        assert_eq!(tx_id, 2);
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_disable_clears_pending_batches() {
        let buffer = LogEntryBuffer::new();
        buffer.enable();

        buffer.emplace(StateDelta::TransactionBegin { tx_id: 5 });
        buffer.disable();
        assert!(buffer.is_empty());

        buffer.enable();
        let (_, batch) = buffer
            .emplace(StateDelta::TransactionCommit { tx_id: 5 })
            .unwrap();
        assert_eq!(batch.len(), 1);
    }
}
