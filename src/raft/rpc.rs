//! Raft RPC message definitions and the transport contract.

use serde::{Deserialize, Serialize};

use super::LogEntry;
use crate::error::Result;
use crate::types::{LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReq {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRes {
    /// Current term, for the candidate to update itself.
    pub term: Term,
    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty entry list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReq {
    /// Leader's term.
    pub term: Term,
    /// Leader's id.
    pub leader_id: NodeId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRes {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower contained an entry matching `prev_log_index`
    /// and `prev_log_term`.
    pub success: bool,
}

/// Peer-id-addressed request/response transport between cluster servers.
///
/// Implementations deliver the request to the target server's inbound
/// handler and block for the reply, enforcing the configured `rpc_timeout`.
/// A transport failure or timeout surfaces as [`crate::ArborError::RpcFailure`];
/// the calling peer thread backs off and retries, so failures are never
/// fatal.
pub trait Coordination: Send + Sync {
    /// Send RequestVote to a peer and await its reply.
    fn request_vote(&self, target: NodeId, request: RequestVoteReq) -> Result<RequestVoteRes>;

    /// Send AppendEntries to a peer and await its reply.
    fn append_entries(&self, target: NodeId, request: AppendEntriesReq)
        -> Result<AppendEntriesRes>;
}
