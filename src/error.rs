//! Error types for the Arbor replication core.
//!
//! This module provides a unified error type [`ArborError`] for all
//! operations, along with a convenient [`Result`] type alias.
//!
//! Errors fall into two groups:
//!
//! - **Recovered locally**: [`ArborError::RpcFailure`], which a peer thread
//!   answers with backoff and retry; it is never fatal.
//! - **Fatal**: [`ArborError::MissingPersistentData`],
//!   [`ArborError::InvalidTransition`], [`ArborError::LogDecode`] and
//!   persistent-store write failures. These stop the consensus core.

use std::io;
use thiserror::Error;

use crate::raft::Mode;
use crate::types::NodeId;

/// Main error type for Arbor consensus operations.
#[derive(Error, Debug)]
pub enum ArborError {
    #[error("missing persistent data under key \"{0}\"")]
    MissingPersistentData(&'static str),

    #[error("invalid mode transition: {from} -> {to}")]
    InvalidTransition { from: Mode, to: Mode },

    #[error("failed to decode persisted raft log: {0}")]
    LogDecode(String),

    #[error("rpc to peer {peer} failed: {reason}")]
    RpcFailure { peer: NodeId, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArborError {
    /// Check if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArborError::RpcFailure { .. })
    }
}

impl From<rocksdb::Error> for ArborError {
    fn from(e: rocksdb::Error) -> Self {
        ArborError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for ArborError {
    fn from(e: bincode::Error) -> Self {
        ArborError::Serialization(e.to_string())
    }
}

/// Result type alias for Arbor consensus operations.
pub type Result<T> = std::result::Result<T, ArborError>;
