//! The Raft server: mode transitions, election timing, replication and
//! commit advancement for one member of the cluster.
//!
//! Concurrency model: all volatile state lives behind one coarse mutex.
//! Dedicated OS threads (an election timer, one replicator per remote peer,
//! a no-op issuer and the applier) drive the protocol and coordinate
//! through three condition variables: `state_changed`, `leader_changed`
//! and `election_changed`. Peer threads release the lock while waiting on
//! an RPC reply; inbound RPC handlers hold it for their full duration,
//! including persistence, which serializes term changes and log mutation.

use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

use super::buffer::LogEntryBuffer;
use super::log::{LogEntry, RaftLog};
use super::replication::ReplicationLog;
use super::rpc::{
    AppendEntriesReq, AppendEntriesRes, Coordination, RequestVoteReq, RequestVoteRes,
};
use super::storage::RaftStorage;
use crate::config::RaftConfig;
use crate::delta::{StateDelta, StateDeltaApplier};
use crate::error::{ArborError, Result};
use crate::types::{LogIndex, NodeId, Term, TransactionId};

/// The mode a Raft server is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Passive mode, responds to RPCs and waits out the election timer.
    Follower,
    /// Transitional mode, requesting votes to become leader.
    Candidate,
    /// Active mode, accepts writes and drives replication.
    Leader,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Follower => write!(f, "FOLLOWER"),
            Mode::Candidate => write!(f, "CANDIDATE"),
            Mode::Leader => write!(f, "LEADER"),
        }
    }
}

/// Votes required for a majority of a cluster of the given size.
fn majority(cluster_size: u16) -> u16 {
    cluster_size / 2 + 1
}

/// Per-peer replication state. Written only under the core lock, each slot
/// effectively owned by that peer's replicator thread.
#[derive(Debug)]
struct PeerState {
    /// Index of the next log entry to send to this peer.
    next_index: LogIndex,
    /// Index of the highest log entry known to be replicated on this peer.
    match_index: LogIndex,
    /// When the next heartbeat is due.
    next_heartbeat: Instant,
    /// Earliest instant at which the replicator may contact the peer again
    /// after an RPC failure.
    backoff_until: Instant,
    /// Whether this term's RequestVote has been sent to the peer.
    vote_requested: bool,
}

impl PeerState {
    fn new(now: Instant) -> Self {
        Self {
            next_index: 1,
            match_index: 0,
            next_heartbeat: now,
            backoff_until: now,
            vote_requested: false,
        }
    }
}

/// All volatile server state, guarded by the core lock.
struct ServerState {
    mode: Mode,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    granted_votes: u16,
    peers: HashMap<NodeId, PeerState>,
    rlog: ReplicationLog,
    next_election: Instant,
    /// Bumped on every election win; wakes the no-op issuer exactly once
    /// per term of leadership.
    leader_epoch: u64,
    exiting: bool,
}

struct ServerInner {
    config: RaftConfig,
    coordination: Arc<dyn Coordination>,
    applier: Arc<dyn StateDeltaApplier>,
    reset_callback: Box<dyn Fn() + Send + Sync>,
    no_op_create: Box<dyn Fn() + Send + Sync>,
    storage: RaftStorage,
    buffer: LogEntryBuffer,
    state: Mutex<ServerState>,
    /// Wakes peer replicators and the applier on any relevant state change.
    state_changed: Condvar,
    /// Wakes the no-op issuer when a new leader is elected.
    leader_changed: Condvar,
    /// Wakes the election timer when `next_election` moves.
    election_changed: Condvar,
}

/// A single server of the replication cluster.
///
/// Owns the persistent term/vote/log, the in-memory log and the protocol
/// threads. The host feeds state deltas in through [`RaftServer::emplace`]
/// and polls [`RaftServer::safe_to_commit`] from its transaction commit
/// path; the transport delivers inbound RPCs to
/// [`RaftServer::handle_request_vote`] and
/// [`RaftServer::handle_append_entries`].
///
/// `reset_callback` runs on every leader-to-follower transition, under the
/// core lock; it must not call back into the server. `no_op_create` runs
/// on every election win, off the lock, and is expected to post a
/// `TransactionBegin`/`NoOp`/`TransactionCommit` sequence through
/// [`RaftServer::emplace`].
pub struct RaftServer {
    inner: Arc<ServerInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftServer {
    /// Create a server, recovering term, vote and log from the durability
    /// directory. Threads are not started until [`RaftServer::start`].
    pub fn new(
        config: RaftConfig,
        coordination: Arc<dyn Coordination>,
        applier: Arc<dyn StateDeltaApplier>,
        reset_callback: Box<dyn Fn() + Send + Sync>,
        no_op_create: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.durability_dir)?;
        let storage = RaftStorage::open(&config.durability_dir)?;
        let (current_term, voted_for, log) = Self::recover(&storage)?;

        info!(
            server_id = config.server_id,
            term = current_term,
            log_len = log.len(),
            "recovered persistent state"
        );
        gauge!("arbor_raft_term").set(current_term as f64);

        let now = Instant::now();
        let peers = (1..=config.cluster_size)
            .filter(|&id| id != config.server_id)
            .map(|id| (id, PeerState::new(now)))
            .collect();

        let state = ServerState {
            mode: Mode::Follower,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            granted_votes: 0,
            peers,
            rlog: ReplicationLog::new(),
            next_election: now,
            leader_epoch: 0,
            exiting: false,
        };

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                coordination,
                applier,
                reset_callback,
                no_op_create,
                storage,
                buffer: LogEntryBuffer::new(),
                state: Mutex::new(state),
                state_changed: Condvar::new(),
                leader_changed: Condvar::new(),
                election_changed: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Read term, vote and log back from storage. A fresh install (nothing
    /// persisted) bootstraps term 0; a missing term next to surviving vote
    /// or log data means the store was damaged.
    fn recover(storage: &RaftStorage) -> Result<(Term, Option<NodeId>, RaftLog)> {
        let entries = storage.load_log()?;
        let voted_for = storage.load_vote()?;

        let current_term = match storage.load_term()? {
            Some(term) => term,
            None => {
                if voted_for.is_some() || !entries.is_empty() {
                    return Err(ArborError::MissingPersistentData("current_term"));
                }
                storage.store_term(0)?;
                0
            }
        };

        Ok((current_term, voted_for, RaftLog::from_entries(entries)))
    }

    /// Start the protocol threads: election timer, one replicator per
    /// remote peer, the no-op issuer and the applier.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            inner.set_next_election(&mut state);
        }

        let mut threads = self.threads.lock();

        let election = Arc::clone(inner);
        threads.push(
            thread::Builder::new()
                .name("raft-election".to_string())
                .spawn(move || election.election_thread_main())?,
        );

        for peer_id in 1..=inner.config.cluster_size {
            if peer_id == inner.config.server_id {
                continue;
            }
            let peer = Arc::clone(inner);
            threads.push(
                thread::Builder::new()
                    .name(format!("raft-peer-{}", peer_id))
                    .spawn(move || peer.peer_thread_main(peer_id))?,
            );
        }

        let no_op = Arc::clone(inner);
        threads.push(
            thread::Builder::new()
                .name("raft-no-op".to_string())
                .spawn(move || no_op.no_op_issuer_thread_main())?,
        );

        let applier = Arc::clone(inner);
        threads.push(
            thread::Builder::new()
                .name("raft-applier".to_string())
                .spawn(move || applier.applier_thread_main())?,
        );

        Ok(())
    }

    /// Stop all protocol threads and wait for them to finish. In-flight
    /// RPC replies are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.exiting = true;
        }
        self.inner.state_changed.notify_all();
        self.inner.leader_changed.notify_all();
        self.inner.election_changed.notify_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Route a state delta into the transaction buffer. When the delta
    /// completes its transaction, the batch is appended to the log for
    /// replication. Returns immediately; on a non-leader this is a no-op.
    pub fn emplace(&self, delta: StateDelta) {
        if let Some((tx_id, batch)) = self.inner.buffer.emplace(delta) {
            if let Err(e) = self.append_to_log(tx_id, batch) {
                error!(tx_id, error = %e, "failed to append transaction batch");
            }
        }
    }

    /// Append a complete transaction batch to the log and kick the peer
    /// replicators. Leader-only; a batch racing a demotion is dropped.
    pub fn append_to_log(&self, tx_id: TransactionId, deltas: Vec<StateDelta>) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.exiting {
            return Ok(());
        }
        if state.mode != Mode::Leader {
            debug!(tx_id, "dropping batch, no longer leader");
            return Ok(());
        }

        let entry = LogEntry::new(state.current_term, deltas);
        state.log.append(entry);
        if let Err(e) = inner.storage.store_log(state.log.entries()) {
            inner.fatal(&mut state, &e);
            return Err(e);
        }
        state.rlog.set_replicating(tx_id);
        counter!("arbor_raft_appended_entries_total").increment(1);
        debug!(
            tx_id,
            index = state.log.last_index(),
            term = state.current_term,
            "appended transaction to log"
        );

        // A single-server cluster has its majority already.
        inner.advance_commit_index(&mut state);
        inner.state_changed.notify_all();
        Ok(())
    }

    /// Check whether the transaction's entries are committed and it is
    /// safe to commit locally.
    pub fn safe_to_commit(&self, tx_id: TransactionId) -> bool {
        self.inner.state.lock().rlog.is_replicated(tx_id)
    }

    /// Drop replication-status records for transactions with id `<= tx_id`.
    pub fn garbage_collect_replication_log(&self, tx_id: TransactionId) {
        self.inner.state.lock().rlog.garbage_collect(tx_id);
    }

    /// True when this server currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().mode == Mode::Leader
    }

    /// The server's current mode.
    pub fn mode(&self) -> Mode {
        self.inner.state.lock().mode
    }

    /// The current term.
    pub fn current_term(&self) -> Term {
        self.inner.state.lock().current_term
    }

    /// The candidate this server voted for in the current term, if any.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.state.lock().voted_for
    }

    /// The highest log index known to be committed.
    pub fn commit_index(&self) -> LogIndex {
        self.inner.state.lock().commit_index
    }

    /// A snapshot of the replicated log.
    pub fn log(&self) -> Vec<LogEntry> {
        self.inner.state.lock().log.entries().to_vec()
    }

    /// Serve an inbound RequestVote RPC.
    pub fn handle_request_vote(&self, request: RequestVoteReq) -> RequestVoteRes {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.exiting || request.term < state.current_term {
            return RequestVoteRes {
                term: state.current_term,
                vote_granted: false,
            };
        }

        if request.term > state.current_term {
            if let Err(e) = inner.update_term(&mut state, request.term) {
                inner.fatal(&mut state, &e);
                return RequestVoteRes {
                    term: state.current_term,
                    vote_granted: false,
                };
            }
            if state.mode != Mode::Follower {
                if let Err(e) = inner.transition(&mut state, Mode::Follower) {
                    inner.fatal(&mut state, &e);
                    return RequestVoteRes {
                        term: state.current_term,
                        vote_granted: false,
                    };
                }
            }
        }

        let free_to_vote = state
            .voted_for
            .map_or(true, |voted| voted == request.candidate_id);
        let up_to_date = state
            .log
            .candidate_up_to_date(request.last_log_index, request.last_log_term);

        if !free_to_vote || !up_to_date {
            debug!(
                candidate = request.candidate_id,
                term = request.term,
                free_to_vote,
                up_to_date,
                "vote denied"
            );
            return RequestVoteRes {
                term: state.current_term,
                vote_granted: false,
            };
        }

        // The vote must be durable before the grant leaves this server.
        if let Err(e) = inner.storage.store_vote(request.candidate_id) {
            inner.fatal(&mut state, &e);
            return RequestVoteRes {
                term: state.current_term,
                vote_granted: false,
            };
        }
        state.voted_for = Some(request.candidate_id);
        inner.set_next_election(&mut state);
        inner.election_changed.notify_all();

        debug!(
            candidate = request.candidate_id,
            term = state.current_term,
            "vote granted"
        );
        RequestVoteRes {
            term: state.current_term,
            vote_granted: true,
        }
    }

    /// Serve an inbound AppendEntries RPC.
    pub fn handle_append_entries(&self, request: AppendEntriesReq) -> AppendEntriesRes {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.exiting || request.term < state.current_term {
            return AppendEntriesRes {
                term: state.current_term,
                success: false,
            };
        }

        if request.term > state.current_term {
            if let Err(e) = inner.update_term(&mut state, request.term) {
                inner.fatal(&mut state, &e);
                return AppendEntriesRes {
                    term: state.current_term,
                    success: false,
                };
            }
        }
        if state.mode != Mode::Follower {
            if let Err(e) = inner.transition(&mut state, Mode::Follower) {
                inner.fatal(&mut state, &e);
                return AppendEntriesRes {
                    term: state.current_term,
                    success: false,
                };
            }
        } else {
            inner.set_next_election(&mut state);
            inner.election_changed.notify_all();
        }

        if !state
            .log
            .matches(request.prev_log_index, request.prev_log_term)
        {
            debug!(
                leader = request.leader_id,
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                "log inconsistency, rejecting entries"
            );
            return AppendEntriesRes {
                term: state.current_term,
                success: false,
            };
        }

        let prev_log_index = request.prev_log_index;
        let mut modified = false;
        for (offset, entry) in request.entries.into_iter().enumerate() {
            let index = prev_log_index + offset as u64 + 1;
            match state.log.term_at(index) {
                Some(term) if term != entry.term => {
                    // Conflicting suffix: everything from here on is
                    // superseded by the leader's log.
                    state.log.truncate_suffix(index);
                    state.log.append(entry);
                    modified = true;
                }
                Some(_) => {} // Already present with a matching term.
                None => {
                    state.log.append(entry);
                    modified = true;
                }
            }
        }

        if modified {
            if let Err(e) = inner.storage.store_log(state.log.entries()) {
                inner.fatal(&mut state, &e);
                return AppendEntriesRes {
                    term: state.current_term,
                    success: false,
                };
            }
        }

        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(state.log.last_index());
            gauge!("arbor_raft_commit_index").set(state.commit_index as f64);
            inner.state_changed.notify_all();
        }

        AppendEntriesRes {
            term: state.current_term,
            success: true,
        }
    }
}

impl ServerInner {
    /// Make a transition to a new mode. Only the edges
    /// follower→candidate, candidate→candidate, candidate→leader,
    /// candidate→follower and leader→follower are legal; anything else is
    /// a programming error.
    fn transition(&self, state: &mut ServerState, to: Mode) -> Result<()> {
        let from = state.mode;
        match (from, to) {
            (Mode::Follower, Mode::Candidate) | (Mode::Candidate, Mode::Candidate) => {
                // New election: bump and persist the term, vote for self.
                let term = state.current_term + 1;
                self.storage.store_term(term)?;
                self.storage.store_vote(self.config.server_id)?;
                state.current_term = term;
                state.voted_for = Some(self.config.server_id);
                state.granted_votes = 1;
                for peer in state.peers.values_mut() {
                    peer.vote_requested = false;
                }
                state.mode = Mode::Candidate;
                self.set_next_election(state);

                counter!("arbor_raft_elections_total").increment(1);
                gauge!("arbor_raft_term").set(term as f64);
                info!(server_id = self.config.server_id, term, "starting election");

                self.state_changed.notify_all();
                self.election_changed.notify_all();

                if state.granted_votes >= majority(self.config.cluster_size) {
                    return self.transition(state, Mode::Leader);
                }
                Ok(())
            }
            (Mode::Candidate, Mode::Leader) => {
                state.mode = Mode::Leader;
                let next_index = state.log.last_index() + 1;
                let now = Instant::now();
                for peer in state.peers.values_mut() {
                    peer.next_index = next_index;
                    peer.match_index = 0;
                    peer.next_heartbeat = now;
                    peer.backoff_until = now;
                }
                self.buffer.enable();
                state.leader_epoch += 1;

                info!(
                    server_id = self.config.server_id,
                    term = state.current_term,
                    "won election, became leader"
                );

                self.state_changed.notify_all();
                self.leader_changed.notify_all();
                self.election_changed.notify_all();
                Ok(())
            }
            (Mode::Candidate, Mode::Follower) | (Mode::Leader, Mode::Follower) => {
                state.mode = Mode::Follower;
                self.buffer.disable();
                if from == Mode::Leader {
                    state.rlog.clear();
                    (self.reset_callback)();
                }
                state.granted_votes = 0;
                self.set_next_election(state);

                info!(
                    server_id = self.config.server_id,
                    term = state.current_term,
                    "stepped down to follower"
                );

                self.state_changed.notify_all();
                self.election_changed.notify_all();
                Ok(())
            }
            _ => Err(ArborError::InvalidTransition { from, to }),
        }
    }

    /// Adopt a newer term. The term and the cleared vote are durable
    /// before any RPC can reveal them.
    fn update_term(&self, state: &mut ServerState, term: Term) -> Result<()> {
        self.storage.store_term(term)?;
        self.storage.clear_vote()?;
        state.current_term = term;
        state.voted_for = None;
        gauge!("arbor_raft_term").set(term as f64);
        Ok(())
    }

    /// Advance the leader's commit index to the highest own-term entry
    /// replicated on a majority.
    fn advance_commit_index(&self, state: &mut ServerState) {
        if state.mode != Mode::Leader {
            return;
        }

        let mut indices: Vec<LogIndex> = state.peers.values().map(|p| p.match_index).collect();
        indices.push(state.log.last_index());
        indices.sort_unstable();
        indices.reverse();

        // The index at the majority'th position is replicated on at least
        // a majority of servers, self included.
        let candidate = indices[majority(self.config.cluster_size) as usize - 1];
        if candidate <= state.commit_index {
            return;
        }
        // Only entries of the leader's own term may be counted (Raft §5.4.2);
        // earlier-term entries commit transitively with them.
        if state.log.term_at(candidate) != Some(state.current_term) {
            return;
        }

        state.commit_index = candidate;
        gauge!("arbor_raft_commit_index").set(candidate as f64);
        debug!(
            server_id = self.config.server_id,
            commit_index = candidate,
            "advanced commit index"
        );
        self.state_changed.notify_all();
    }

    /// Reset the election deadline to now plus a uniformly random timeout
    /// from the configured window.
    fn set_next_election(&self, state: &mut ServerState) {
        let mut rng = rand::thread_rng();
        let timeout =
            rng.gen_range(self.config.election_timeout_min..self.config.election_timeout_max);
        state.next_election = Instant::now() + timeout;
    }

    /// Record an unrecoverable failure and stop the server.
    fn fatal(&self, state: &mut ServerState, err: &ArborError) {
        error!(server_id = self.config.server_id, error = %err, "fatal failure, shutting down");
        state.exiting = true;
        self.state_changed.notify_all();
        self.leader_changed.notify_all();
        self.election_changed.notify_all();
    }

    /// Election timer. The only thread that spontaneously makes this
    /// server a candidate.
    fn election_thread_main(&self) {
        let mut guard = self.state.lock();
        loop {
            if guard.exiting {
                break;
            }
            if guard.mode == Mode::Leader {
                self.election_changed.wait(&mut guard);
                continue;
            }
            let deadline = guard.next_election;
            if Instant::now() >= deadline {
                debug!(
                    server_id = self.config.server_id,
                    "election timeout elapsed"
                );
                if let Err(e) = self.transition(&mut guard, Mode::Candidate) {
                    self.fatal(&mut guard, &e);
                    break;
                }
            } else {
                self.election_changed.wait_until(&mut guard, deadline);
            }
        }
    }

    /// Outgoing-RPC thread for one remote peer.
    fn peer_thread_main(&self, peer_id: NodeId) {
        let mut guard = self.state.lock();
        loop {
            if guard.exiting {
                break;
            }
            match guard.mode {
                Mode::Follower => {
                    self.state_changed.wait(&mut guard);
                }
                Mode::Candidate => {
                    let requested = guard
                        .peers
                        .get(&peer_id)
                        .map(|p| p.vote_requested)
                        .unwrap_or(true);
                    if requested {
                        self.state_changed.wait(&mut guard);
                    } else {
                        self.request_vote_from(&mut guard, peer_id);
                    }
                }
                Mode::Leader => {
                    let now = Instant::now();
                    let Some(peer) = guard.peers.get(&peer_id) else {
                        break;
                    };
                    let backoff_until = peer.backoff_until;
                    let next_heartbeat = peer.next_heartbeat;
                    let next_index = peer.next_index;

                    if backoff_until > now {
                        self.state_changed.wait_until(&mut guard, backoff_until);
                    } else if guard.log.last_index() >= next_index || now >= next_heartbeat {
                        self.send_entries(&mut guard, peer_id);
                    } else {
                        self.state_changed.wait_until(&mut guard, next_heartbeat);
                    }
                }
            }
        }
    }

    /// Send AppendEntries (possibly an empty heartbeat) to a peer and fold
    /// the reply back into leader state. The lock is released while the
    /// reply is outstanding; a stale reply (mode or term moved on) is
    /// dropped.
    fn send_entries(&self, guard: &mut MutexGuard<'_, ServerState>, peer_id: NodeId) {
        let term_at_send = guard.current_term;
        let next_index = {
            let Some(peer) = guard.peers.get_mut(&peer_id) else {
                return;
            };
            peer.next_heartbeat = Instant::now() + self.config.heartbeat_interval;
            peer.next_index
        };

        let prev_log_index = next_index - 1;
        let prev_log_term = guard.log.term_at(prev_log_index).unwrap_or(0);
        let entries = guard.log.suffix_from(next_index);
        let sent = entries.len() as u64;
        let request = AppendEntriesReq {
            term: term_at_send,
            leader_id: self.config.server_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: guard.commit_index,
        };

        let coordination = Arc::clone(&self.coordination);
        let reply = MutexGuard::unlocked(guard, move || {
            coordination.append_entries(peer_id, request)
        });

        if guard.exiting || guard.mode != Mode::Leader || guard.current_term != term_at_send {
            return;
        }

        match reply {
            Err(e) => {
                debug!(peer = peer_id, error = %e, "append entries failed, backing off");
                if let Some(peer) = guard.peers.get_mut(&peer_id) {
                    peer.backoff_until = Instant::now() + self.config.rpc_backoff;
                }
            }
            Ok(res) if res.term > guard.current_term => {
                debug!(
                    peer = peer_id,
                    term = res.term,
                    "reply from a newer term, stepping down"
                );
                if let Err(e) = self.update_term(guard, res.term) {
                    self.fatal(guard, &e);
                    return;
                }
                if let Err(e) = self.transition(guard, Mode::Follower) {
                    self.fatal(guard, &e);
                }
            }
            Ok(res) if res.success => {
                if let Some(peer) = guard.peers.get_mut(&peer_id) {
                    peer.match_index = prev_log_index + sent;
                    peer.next_index = peer.match_index + 1;
                }
                self.advance_commit_index(guard);
            }
            Ok(_) => {
                // Log inconsistency: step one entry back and retry.
                if let Some(peer) = guard.peers.get_mut(&peer_id) {
                    peer.next_index = peer.next_index.saturating_sub(1).max(1);
                }
            }
        }
    }

    /// Send this term's RequestVote to a peer and count the reply. Votes
    /// are requested at most once per peer per term.
    fn request_vote_from(&self, guard: &mut MutexGuard<'_, ServerState>, peer_id: NodeId) {
        let term_at_send = guard.current_term;
        let (last_log_index, last_log_term) = guard.log.last_entry_data();
        match guard.peers.get_mut(&peer_id) {
            Some(peer) => peer.vote_requested = true,
            None => return,
        }
        let request = RequestVoteReq {
            term: term_at_send,
            candidate_id: self.config.server_id,
            last_log_index,
            last_log_term,
        };

        let coordination = Arc::clone(&self.coordination);
        let reply = MutexGuard::unlocked(guard, move || {
            coordination.request_vote(peer_id, request)
        });

        if guard.exiting || guard.mode != Mode::Candidate || guard.current_term != term_at_send {
            return;
        }

        match reply {
            Err(e) => {
                // No retry this term; the next election timeout covers it.
                debug!(peer = peer_id, error = %e, "request vote failed");
            }
            Ok(res) if res.term > guard.current_term => {
                if let Err(e) = self.update_term(guard, res.term) {
                    self.fatal(guard, &e);
                    return;
                }
                if let Err(e) = self.transition(guard, Mode::Follower) {
                    self.fatal(guard, &e);
                }
            }
            Ok(res) if res.vote_granted => {
                guard.granted_votes += 1;
                debug!(
                    peer = peer_id,
                    votes = guard.granted_votes,
                    term = term_at_send,
                    "vote received"
                );
                if guard.granted_votes >= majority(self.config.cluster_size) {
                    if let Err(e) = self.transition(guard, Mode::Leader) {
                        self.fatal(guard, &e);
                    }
                }
            }
            Ok(_) => {}
        }
    }

    /// Posts the no-op transaction after every election win, forcing an
    /// entry of the new leader's term into the log so earlier-term entries
    /// can commit (Raft §5.4.2).
    fn no_op_issuer_thread_main(&self) {
        // Starting from zero covers an election won before the first wait.
        let mut seen_epoch = 0;
        let mut guard = self.state.lock();
        loop {
            if guard.exiting {
                break;
            }
            if guard.leader_epoch == seen_epoch {
                self.leader_changed.wait(&mut guard);
                continue;
            }
            seen_epoch = guard.leader_epoch;
            if guard.mode == Mode::Leader {
                // The callback feeds emplace(), which takes the buffer and
                // core locks itself.
                MutexGuard::unlocked(&mut guard, || (self.no_op_create)());
            }
        }
    }

    /// Applies committed entries in strict index order. Sole writer of
    /// `last_applied`.
    fn applier_thread_main(&self) {
        let mut guard = self.state.lock();
        loop {
            if guard.exiting {
                break;
            }
            if guard.last_applied >= guard.commit_index {
                self.state_changed.wait(&mut guard);
                continue;
            }

            let index = guard.last_applied + 1;
            let Some(entry) = guard.log.get(index).cloned() else {
                self.fatal(
                    &mut guard,
                    &ArborError::Internal(format!("committed entry {} missing from log", index)),
                );
                break;
            };

            let applier = Arc::clone(&self.applier);
            MutexGuard::unlocked(&mut guard, || {
                for delta in &entry.deltas {
                    applier.apply(delta);
                }
            });
            if guard.exiting {
                break;
            }
            guard.last_applied = index;

            if guard.mode == Mode::Leader {
                for delta in &entry.deltas {
                    if let StateDelta::TransactionCommit { tx_id } = *delta {
                        guard.rlog.set_replicated(tx_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftConfig;
    use std::path::Path;
    use tempfile::tempdir;

    struct NullApplier;

    impl StateDeltaApplier for NullApplier {
        fn apply(&self, _delta: &StateDelta) {}
    }

    struct UnreachableCoordination;

    impl Coordination for UnreachableCoordination {
        fn request_vote(&self, target: NodeId, _request: RequestVoteReq) -> Result<RequestVoteRes> {
            Err(ArborError::RpcFailure {
                peer: target,
                reason: "unreachable".to_string(),
            })
        }

        fn append_entries(
            &self,
            target: NodeId,
            _request: AppendEntriesReq,
        ) -> Result<AppendEntriesRes> {
            Err(ArborError::RpcFailure {
                peer: target,
                reason: "unreachable".to_string(),
            })
        }
    }

    /// An unstarted three-server member; handlers are exercised directly.
    fn test_server(dir: &Path) -> RaftServer {
        let config = RaftConfig {
            server_id: 1,
            cluster_size: 3,
            durability_dir: dir.to_path_buf(),
            ..RaftConfig::default()
        };
        RaftServer::new(
            config,
            Arc::new(UnreachableCoordination),
            Arc::new(NullApplier),
            Box::new(|| {}),
            Box::new(|| {}),
        )
        .unwrap()
    }

    fn entry(term: Term, tx_id: u64) -> LogEntry {
        LogEntry::new(
            term,
            vec![
                StateDelta::TransactionBegin { tx_id },
                StateDelta::TransactionCommit { tx_id },
            ],
        )
    }

    fn append_req(
        term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> AppendEntriesReq {
        AppendEntriesReq {
            term,
            leader_id: 2,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    #[test]
    fn test_initial_state() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        assert_eq!(server.mode(), Mode::Follower);
        assert_eq!(server.current_term(), 0);
        assert_eq!(server.voted_for(), None);
        assert_eq!(server.commit_index(), 0);
        assert!(!server.is_leader());
        assert!(server.log().is_empty());
    }

    #[test]
    fn test_fresh_install_bootstraps_term() {
        let dir = tempdir().unwrap();
        {
            let _server = test_server(dir.path());
        }
        let storage = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load_term().unwrap(), Some(0));
    }

    #[test]
    fn test_missing_term_with_surviving_log_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let storage = RaftStorage::open(dir.path()).unwrap();
            storage.store_log(&[entry(1, 1)]).unwrap();
        }

        let config = RaftConfig {
            server_id: 1,
            cluster_size: 3,
            durability_dir: dir.path().to_path_buf(),
            ..RaftConfig::default()
        };
        let result = RaftServer::new(
            config,
            Arc::new(UnreachableCoordination),
            Arc::new(NullApplier),
            Box::new(|| {}),
            Box::new(|| {}),
        );
        assert!(matches!(
            result,
            Err(ArborError::MissingPersistentData("current_term"))
        ));
    }

    #[test]
    fn test_recovers_persisted_state() {
        let dir = tempdir().unwrap();
        {
            let storage = RaftStorage::open(dir.path()).unwrap();
            storage.store_term(4).unwrap();
            storage.store_vote(3).unwrap();
            storage.store_log(&[entry(2, 1), entry(4, 2)]).unwrap();
        }

        let server = test_server(dir.path());
        assert_eq!(server.current_term(), 4);
        assert_eq!(server.voted_for(), Some(3));
        assert_eq!(server.log().len(), 2);
    }

    #[test]
    fn test_grants_vote_once_per_term() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        let res = server.handle_request_vote(RequestVoteReq {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(res.vote_granted);
        assert_eq!(res.term, 1);
        assert_eq!(server.voted_for(), Some(2));

        // A different candidate in the same term is refused.
        let res = server.handle_request_vote(RequestVoteReq {
            term: 1,
            candidate_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!res.vote_granted);

        // The same candidate may ask again.
        let res = server.handle_request_vote(RequestVoteReq {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(res.vote_granted);
    }

    #[test]
    fn test_vote_persisted_before_grant() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.handle_request_vote(RequestVoteReq {
            term: 1,
            candidate_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        });

        server.shutdown();
        drop(server);
        let storage = RaftStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load_term().unwrap(), Some(1));
        assert_eq!(storage.load_vote().unwrap(), Some(3));
    }

    #[test]
    fn test_rejects_stale_vote_request() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.handle_append_entries(append_req(5, 0, 0, vec![], 0));
        assert_eq!(server.current_term(), 5);

        let res = server.handle_request_vote(RequestVoteReq {
            term: 3,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!res.vote_granted);
        assert_eq!(res.term, 5);
    }

    #[test]
    fn test_denies_vote_to_out_of_date_candidate() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        let res = server.handle_append_entries(append_req(2, 0, 0, vec![entry(2, 1)], 0));
        assert!(res.success);

        // The candidate's log ends at (0, 0), behind ours at (1, 2); the
        // higher term is still adopted.
        let res = server.handle_request_vote(RequestVoteReq {
            term: 3,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!res.vote_granted);
        assert_eq!(res.term, 3);
        assert_eq!(server.current_term(), 3);
    }

    #[test]
    fn test_append_entries_stores_and_acks() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        let res = server.handle_append_entries(append_req(1, 0, 0, vec![entry(1, 1)], 0));
        assert!(res.success);
        assert_eq!(res.term, 1);
        assert_eq!(server.log().len(), 1);
        assert_eq!(server.commit_index(), 0);

        // Heartbeat carrying the leader's commit index.
        let res = server.handle_append_entries(append_req(1, 1, 1, vec![], 1));
        assert!(res.success);
        assert_eq!(server.commit_index(), 1);
    }

    #[test]
    fn test_append_entries_rejects_stale_term() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.handle_append_entries(append_req(5, 0, 0, vec![], 0));

        let res = server.handle_append_entries(append_req(4, 0, 0, vec![entry(4, 1)], 0));
        assert!(!res.success);
        assert_eq!(res.term, 5);
        assert!(server.log().is_empty());
    }

    #[test]
    fn test_append_entries_rejects_missing_prev_entry() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        let res = server.handle_append_entries(append_req(1, 5, 1, vec![entry(1, 1)], 0));
        assert!(!res.success);
        assert!(server.log().is_empty());
    }

    #[test]
    fn test_append_entries_rejects_prev_term_mismatch() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.handle_append_entries(append_req(1, 0, 0, vec![entry(1, 1)], 0));

        let res = server.handle_append_entries(append_req(2, 1, 2, vec![entry(2, 2)], 0));
        assert!(!res.success);
        assert_eq!(server.log().len(), 1);
    }

    #[test]
    fn test_append_entries_truncates_conflicting_suffix() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.handle_append_entries(append_req(
            1,
            0,
            0,
            vec![entry(1, 1), entry(1, 2), entry(1, 3)],
            0,
        ));
        assert_eq!(server.log().len(), 3);

        // A new leader overwrites everything from index 2 on.
        let res =
            server.handle_append_entries(append_req(2, 1, 1, vec![entry(2, 4), entry(2, 5)], 0));
        assert!(res.success);

        let log = server.log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].term, 1);
        assert_eq!(log[1].term, 2);
        assert_eq!(log[2].term, 2);
        assert_eq!(log[1].deltas[0].tx_id(), 4);
    }

    #[test]
    fn test_append_entries_is_idempotent() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        let request = append_req(1, 0, 0, vec![entry(1, 1), entry(1, 2)], 0);
        let res = server.handle_append_entries(request.clone());
        assert!(res.success);
        let log_before = server.log();

        let res = server.handle_append_entries(request);
        assert!(res.success);
        assert_eq!(server.log(), log_before);
    }

    #[test]
    fn test_commit_index_capped_by_log_length() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        let res = server.handle_append_entries(append_req(1, 0, 0, vec![entry(1, 1)], 100));
        assert!(res.success);
        assert_eq!(server.commit_index(), 1);
    }

    #[test]
    fn test_append_entries_adopts_leader_term() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.handle_append_entries(append_req(2, 0, 0, vec![], 0));
        assert_eq!(server.mode(), Mode::Follower);
        assert_eq!(server.current_term(), 2);
        assert_eq!(server.voted_for(), None);
    }

    #[test]
    fn test_emplace_is_noop_on_follower() {
        let dir = tempdir().unwrap();
        let server = test_server(dir.path());

        server.emplace(StateDelta::TransactionBegin { tx_id: 7 });
        server.emplace(StateDelta::TransactionCommit { tx_id: 7 });

        assert!(server.log().is_empty());
        assert!(!server.safe_to_commit(7));
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(5), 3);
    }
}
