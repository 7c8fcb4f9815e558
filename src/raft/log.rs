//! Replicated log implementation.

use serde::{Deserialize, Serialize};

use crate::delta::StateDelta;
use crate::types::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// On a leader the delta sequence is one whole transaction; on a follower it
/// is whatever batch the leader shipped in AppendEntries. The entry's
/// position is implicit in its place in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was appended by a leader.
    pub term: Term,
    /// The ordered state deltas carried by this entry.
    pub deltas: Vec<StateDelta>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(term: Term, deltas: Vec<StateDelta>) -> Self {
        Self { term, deltas }
    }
}

/// The in-memory replicated log.
///
/// The log is 1-indexed to stay consistent with the paper; index 0 is the
/// reserved sentinel with term 0. Persistence is handled by `RaftStorage`;
/// the server persists the full log after every mutation.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild the log from recovered entries.
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    /// Get the number of entries in the log. Equal to the last index.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the index of the last log entry, or 0 for an empty log.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as u64
    }

    /// Get the term of the last log entry, or 0 for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Index and term of the last entry, `(0, 0)` for an empty log.
    pub fn last_entry_data(&self) -> (LogIndex, Term) {
        (self.last_index(), self.last_term())
    }

    /// Get an entry by 1-based index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 || index > self.last_index() {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Get the term at a specific index. Index 0 is the sentinel with term
    /// 0; indices beyond the log return `None`.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Append an entry at the end of the log.
    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Entries with index `>= start`, cloned. Empty when `start` is past
    /// the end of the log.
    pub fn suffix_from(&self, start: LogIndex) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries[start as usize - 1..].to_vec()
    }

    /// Delete entries with index `>= start`. Follower-only operation, used
    /// when reconciling a conflicting suffix against the leader's log.
    pub fn truncate_suffix(&mut self, start: LogIndex) {
        let keep = start.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// All entries, in order, for persistence.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Check if our log matches the leader's at the given index and term.
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        match self.term_at(prev_log_index) {
            Some(term) => term == prev_log_term,
            None => false,
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours, as
    /// defined in Raft §5.4: compare last terms, then last indices.
    pub fn candidate_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.last_term();
        let our_last_index = self.last_index();

        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= our_last_index
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::StateDelta;

    fn entry(term: Term, tx_id: u64) -> LogEntry {
        LogEntry::new(
            term,
            vec![
                StateDelta::TransactionBegin { tx_id },
                StateDelta::TransactionCommit { tx_id },
            ],
        )
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.last_entry_data(), (0, 0));
    }

    #[test]
    fn test_append() {
        let mut log = RaftLog::new();

        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        assert_eq!(log.len(), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_get_entry() {
        let mut log = RaftLog::new();
        log.append(entry(1, 10));
        log.append(entry(2, 20));

        assert!(log.get(0).is_none());
        assert_eq!(log.get(1).unwrap().deltas[0].tx_id(), 10);
        assert_eq!(log.get(2).unwrap().deltas[0].tx_id(), 20);
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_term_at_boundary() {
        let mut log = RaftLog::new();
        log.append(entry(3, 1));

        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), Some(3));
        assert_eq!(log.term_at(2), None);
    }

    #[test]
    fn test_truncate_suffix() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(1, 3));

        log.truncate_suffix(2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_index(), 1);
        assert!(log.get(2).is_none());
    }

    #[test]
    fn test_suffix_from() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        assert_eq!(log.suffix_from(1).len(), 3);

        let suffix = log.suffix_from(2);
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix[0].deltas[0].tx_id(), 2);

        assert_eq!(log.suffix_from(3).len(), 1);
        assert!(log.suffix_from(4).is_empty());
    }

    #[test]
    fn test_matches() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(2, 2));

        assert!(log.matches(0, 0));
        assert!(log.matches(1, 1));
        assert!(log.matches(2, 2));
        assert!(!log.matches(2, 1));
        assert!(!log.matches(3, 2));
    }

    #[test]
    fn test_candidate_up_to_date() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(2, 2));

        // Higher last term is always more up-to-date.
        assert!(log.candidate_up_to_date(1, 3));
        // Same term, higher index.
        assert!(log.candidate_up_to_date(3, 2));
        // Same term, same index.
        assert!(log.candidate_up_to_date(2, 2));
        // Lower last term is never up-to-date.
        assert!(!log.candidate_up_to_date(100, 1));
    }

    #[test]
    fn test_empty_log_grants_to_anyone() {
        let log = RaftLog::new();
        assert!(log.candidate_up_to_date(0, 0));
    }
}
