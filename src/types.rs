//! Core type aliases shared across the Arbor replication core.
//!
//! Identifiers are plain integer aliases for clarity:
//!
//! - [`NodeId`] = `u16`: cluster server identifier (servers are numbered
//!   `1..=cluster_size`)
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: 1-based Raft log position (0 is the sentinel)
//! - [`TransactionId`] = `u64`: transaction identifier assigned by the host
//! - [`Gid`] = `u64`: global id of a graph object (vertex or edge)

/// Cluster server identifier.
pub type NodeId = u16;

/// Raft term number.
pub type Term = u64;

/// Raft log position. The log is 1-indexed; 0 is the reserved sentinel.
pub type LogIndex = u64;

/// Transaction identifier assigned by the host transaction engine.
pub type TransactionId = u64;

/// Global id of a graph object.
pub type Gid = u64;
