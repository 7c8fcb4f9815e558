//! Per-transaction replication status.

use std::collections::HashMap;

use crate::types::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    /// Appended to the leader's log, awaiting majority commit.
    Replicating,
    /// Committed on a majority and applied locally.
    Replicated,
}

/// Tracks replication progress of transactions appended by the local leader.
///
/// A transaction becomes `Replicating` when its batch is appended to the
/// log, and `Replicated` once the applier has applied its commit delta,
/// which only happens after the entry is covered by `commit_index`. The
/// host's commit path polls `is_replicated` through `safe_to_commit`.
#[derive(Debug, Default)]
pub struct ReplicationLog {
    statuses: HashMap<TransactionId, TxStatus>,
}

impl ReplicationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a transaction as appended and awaiting majority replication.
    pub fn set_replicating(&mut self, tx_id: TransactionId) {
        self.statuses.insert(tx_id, TxStatus::Replicating);
    }

    /// Mark a transaction as committed and applied.
    pub fn set_replicated(&mut self, tx_id: TransactionId) {
        self.statuses.insert(tx_id, TxStatus::Replicated);
    }

    /// Check if a transaction is still awaiting majority replication.
    pub fn is_replicating(&self, tx_id: TransactionId) -> bool {
        self.statuses.get(&tx_id) == Some(&TxStatus::Replicating)
    }

    /// Check if a transaction's entries are committed.
    pub fn is_replicated(&self, tx_id: TransactionId) -> bool {
        self.statuses.get(&tx_id) == Some(&TxStatus::Replicated)
    }

    /// Drop status records for transactions with id `<= up_to`.
    pub fn garbage_collect(&mut self, up_to: TransactionId) {
        self.statuses.retain(|&tx_id, _| tx_id > up_to);
    }

    /// Drop all status records. Called when leadership is lost.
    pub fn clear(&mut self) {
        self.statuses.clear();
    }
}
