//! State deltas: the replicated unit of state-machine change.
//!
//! A [`StateDelta`] describes one mutation of the graph store, tagged with
//! the transaction that produced it. The consensus core treats deltas as
//! opaque payloads except for the transaction control kinds
//! ([`StateDelta::TransactionBegin`], [`StateDelta::TransactionCommit`],
//! [`StateDelta::TransactionAbort`]) and [`StateDelta::NoOp`], which drive
//! log buffering and leader no-op commits.

use serde::{Deserialize, Serialize};

use crate::types::{Gid, TransactionId};

/// One ordered unit of state-machine change.
///
/// Every variant carries the id of the transaction it belongs to. A
/// transaction is the delta sequence bracketed by `TransactionBegin` and
/// `TransactionCommit` (or `TransactionAbort`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateDelta {
    /// Marks the start of a transaction.
    TransactionBegin { tx_id: TransactionId },
    /// Marks a committed transaction; triggers replication of its batch.
    TransactionCommit { tx_id: TransactionId },
    /// Marks an aborted transaction; its buffered batch is discarded.
    TransactionAbort { tx_id: TransactionId },
    /// Carries a new leader's term into a committed entry. No state change.
    NoOp { tx_id: TransactionId },
    /// Create a vertex with the given global id.
    CreateVertex { tx_id: TransactionId, gid: Gid },
    /// Remove the vertex with the given global id.
    RemoveVertex { tx_id: TransactionId, gid: Gid },
    /// Create an edge between two vertices.
    CreateEdge {
        tx_id: TransactionId,
        gid: Gid,
        from: Gid,
        to: Gid,
        edge_type: String,
    },
    /// Remove the edge with the given global id.
    RemoveEdge { tx_id: TransactionId, gid: Gid },
    /// Add a label to a vertex.
    AddLabel {
        tx_id: TransactionId,
        gid: Gid,
        label: String,
    },
    /// Remove a label from a vertex.
    RemoveLabel {
        tx_id: TransactionId,
        gid: Gid,
        label: String,
    },
    /// Set a property on a graph object.
    SetProperty {
        tx_id: TransactionId,
        gid: Gid,
        property: String,
        value: String,
    },
}

impl StateDelta {
    /// The id of the transaction this delta belongs to.
    pub fn tx_id(&self) -> TransactionId {
        match *self {
            StateDelta::TransactionBegin { tx_id }
            | StateDelta::TransactionCommit { tx_id }
            | StateDelta::TransactionAbort { tx_id }
            | StateDelta::NoOp { tx_id }
            | StateDelta::CreateVertex { tx_id, .. }
            | StateDelta::RemoveVertex { tx_id, .. }
            | StateDelta::CreateEdge { tx_id, .. }
            | StateDelta::RemoveEdge { tx_id, .. }
            | StateDelta::AddLabel { tx_id, .. }
            | StateDelta::RemoveLabel { tx_id, .. }
            | StateDelta::SetProperty { tx_id, .. } => tx_id,
        }
    }

    /// True for the delta that commits its transaction.
    pub fn is_commit(&self) -> bool {
        matches!(self, StateDelta::TransactionCommit { .. })
    }

    /// True for the delta that aborts its transaction.
    pub fn is_abort(&self) -> bool {
        matches!(self, StateDelta::TransactionAbort { .. })
    }
}

/// Applies committed deltas to the local graph state machine.
///
/// Implemented by the host database. Application errors are the applier's
/// to handle through its own error path; the consensus core keeps
/// replicating regardless.
pub trait StateDeltaApplier: Send + Sync {
    /// Apply a single committed delta. Called from the applier thread, in
    /// strict log order, at most once per delta.
    fn apply(&self, delta: &StateDelta);
}
