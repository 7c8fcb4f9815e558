//! Persistent storage for Raft state.

use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::LogEntry;
use crate::error::{ArborError, Result};
use crate::types::{NodeId, Term};

const TERM_KEY: &[u8] = b"current_term";
const VOTE_KEY: &[u8] = b"voted_for";
const LOG_KEY: &[u8] = b"raft_log";

/// Durable term/vote/log slots backed by the node's key-value store.
///
/// Every store call flushes before returning, so a successful write is
/// visible after a crash. The server persists term and vote before any
/// outgoing RPC reveals them, and the log before acknowledging an
/// AppendEntries.
///
/// On-disk layouts are fixed-width little-endian with `u64` length
/// prefixes: the term is a bare `u64`, the vote is
/// `u64 present_flag` ‖ `u16 peer_id`, and the log is
/// `u64 entry_count` ‖ entries, each `u64 term` ‖ `u64 delta_count` ‖
/// deltas.
pub struct RaftStorage {
    db: DB,
}

/// On-disk layout of the vote slot. The peer id is ignored when the flag
/// is 0.
#[derive(Debug, Serialize, Deserialize)]
struct VoteRecord {
    present: u64,
    peer_id: NodeId,
}

impl RaftStorage {
    /// Open or create the durable store in the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Load the current term. `None` on a fresh install.
    pub fn load_term(&self) -> Result<Option<Term>> {
        match self.db.get(TERM_KEY)? {
            Some(data) => {
                let term: Term = bincode::deserialize(&data)?;
                Ok(Some(term))
            }
            None => Ok(None),
        }
    }

    /// Persist the current term. Durable before return.
    pub fn store_term(&self, term: Term) -> Result<()> {
        let data = bincode::serialize(&term)?;
        self.db.put(TERM_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load the vote for the current term, if one was granted.
    pub fn load_vote(&self) -> Result<Option<NodeId>> {
        match self.db.get(VOTE_KEY)? {
            Some(data) => {
                let record: VoteRecord = bincode::deserialize(&data)?;
                if record.present == 0 {
                    Ok(None)
                } else {
                    Ok(Some(record.peer_id))
                }
            }
            None => Ok(None),
        }
    }

    /// Persist a vote for the given peer. Durable before return.
    pub fn store_vote(&self, peer_id: NodeId) -> Result<()> {
        self.write_vote(VoteRecord {
            present: 1,
            peer_id,
        })
    }

    /// Erase the vote for the current term. Durable before return.
    pub fn clear_vote(&self) -> Result<()> {
        self.write_vote(VoteRecord {
            present: 0,
            peer_id: 0,
        })
    }

    fn write_vote(&self, record: VoteRecord) -> Result<()> {
        let data = bincode::serialize(&record)?;
        self.db.put(VOTE_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load the persisted log. Empty when absent; a malformed log is fatal
    /// and requires operator intervention.
    pub fn load_log(&self) -> Result<Vec<LogEntry>> {
        match self.db.get(LOG_KEY)? {
            Some(data) => {
                bincode::deserialize(&data).map_err(|e| ArborError::LogDecode(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Persist the whole log. Durable before return.
    pub fn store_log(&self, entries: &[LogEntry]) -> Result<()> {
        let data = bincode::serialize(&entries)?;
        self.db.put(LOG_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::StateDelta;
    use tempfile::tempdir;

    fn entry(term: Term, tx_id: u64) -> LogEntry {
        LogEntry::new(
            term,
            vec![
                StateDelta::TransactionBegin { tx_id },
                StateDelta::CreateVertex { tx_id, gid: tx_id },
                StateDelta::TransactionCommit { tx_id },
            ],
        )
    }

    #[test]
    fn test_fresh_install_is_empty() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        assert!(storage.load_term().unwrap().is_none());
        assert!(storage.load_vote().unwrap().is_none());
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn test_term_round_trip() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        storage.store_term(7).unwrap();
        assert_eq!(storage.load_term().unwrap(), Some(7));

        storage.store_term(8).unwrap();
        assert_eq!(storage.load_term().unwrap(), Some(8));
    }

    #[test]
    fn test_vote_round_trip() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        storage.store_vote(3).unwrap();
        assert_eq!(storage.load_vote().unwrap(), Some(3));

        storage.clear_vote().unwrap();
        assert_eq!(storage.load_vote().unwrap(), None);
    }

    #[test]
    fn test_log_round_trip() {
        let dir = tempdir().unwrap();
        let storage = RaftStorage::open(dir.path()).unwrap();

        let entries = vec![entry(1, 1), entry(1, 2), entry(2, 3)];
        storage.store_log(&entries).unwrap();

        let loaded = storage.load_log().unwrap();
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_persistence_across_reopens() {
        let dir = tempdir().unwrap();

        {
            let storage = RaftStorage::open(dir.path()).unwrap();
            storage.store_term(42).unwrap();
            storage.store_vote(2).unwrap();
            storage.store_log(&[entry(42, 9)]).unwrap();
        }

        {
            let storage = RaftStorage::open(dir.path()).unwrap();
            assert_eq!(storage.load_term().unwrap(), Some(42));
            assert_eq!(storage.load_vote().unwrap(), Some(2));
            let log = storage.load_log().unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].term, 42);
        }
    }

    #[test]
    fn test_log_reencode_is_bit_identical() {
        let entries = vec![entry(1, 1), entry(3, 2)];

        let encoded = bincode::serialize(&entries).unwrap();
        let decoded: Vec<LogEntry> = bincode::deserialize(&encoded).unwrap();
        let reencoded = bincode::serialize(&decoded).unwrap();

        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn test_persistent_layouts_are_little_endian() {
        // Term: bare u64.
        assert_eq!(bincode::serialize(&0x0102u64).unwrap(), {
            let mut b = vec![0u8; 8];
            b[0] = 0x02;
            b[1] = 0x01;
            b
        });

        // Vote: u64 present flag, then u16 peer id.
        let record = VoteRecord {
            present: 1,
            peer_id: 0x0304,
        };
        let bytes = bincode::serialize(&record).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[8..], &[0x04, 0x03]);

        // Log: u64 entry count prefix.
        let log = vec![entry(1, 1)];
        let bytes = bincode::serialize(&log).unwrap();
        assert_eq!(&bytes[..8], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }
}
