//! The in-memory replicated log.

use gavel_core::{Command, LogIndex, TermId};

/// A single record in the replicated log.
///
/// Records are created by the leader on submission, appended on followers
/// by replication, and removed only by conflict repair. They are never
/// reordered or mutated in place. Completion notifiers for locally
/// submitted records live beside the log (see [`crate::PendingCommits`]),
/// so replicated copies structurally cannot carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// The term in which the leader first appended this record.
    pub term: TermId,
    /// The record's log index.
    pub index: LogIndex,
    /// The replicated command.
    pub command: Command,
}

impl LogRecord {
    /// Creates a new log record.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// In-memory ordered log. Indexes are 1-based; 0 means "nothing".
#[derive(Debug, Default)]
pub struct RaftLog {
    records: Vec<LogRecord>,
}

impl RaftLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Returns true if the log has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    /// Returns the last index, or the sentinel if empty.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.records.len() as u64)
    }

    /// Returns the term of the last record, or term 0 if empty.
    #[must_use]
    pub fn last_term(&self) -> TermId {
        self.records.last().map_or(TermId::new(0), |r| r.term)
    }

    /// Gets a record by index.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogRecord> {
        if index == LogIndex::NONE {
            return None;
        }
        self.records.get((index.get() - 1) as usize)
    }

    /// Returns the term at an index, or term 0 if absent.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> TermId {
        self.get(index).map_or(TermId::new(0), |r| r.term)
    }

    /// Returns true if the log holds a record at `index` with term `term`.
    /// Index 0 always matches (the empty prefix).
    #[must_use]
    pub fn matches(&self, index: LogIndex, term: TermId) -> bool {
        index == LogIndex::NONE || self.get(index).is_some_and(|r| r.term == term)
    }

    /// Appends one record.
    ///
    /// # Panics
    /// Panics if the record's index is not the next sequential index.
    pub fn append(&mut self, record: LogRecord) {
        let expected = self.last_index().next();
        assert_eq!(
            record.index, expected,
            "log record index must be sequential: expected {expected}, got {}",
            record.index
        );
        self.records.push(record);
    }

    /// Truncates the log, keeping records up to and including `last_kept`.
    pub fn truncate_to(&mut self, last_kept: LogIndex) {
        self.records.truncate(last_kept.get() as usize);
    }

    /// Returns clones of the records in `[start, last_index]`, at most
    /// `max` of them.
    #[must_use]
    pub fn slice_from(&self, start: LogIndex, max: usize) -> Vec<LogRecord> {
        if start == LogIndex::NONE || start > self.last_index() {
            return Vec::new();
        }
        self.records[(start.get() - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Returns true if a candidate log described by (`their_term`,
    /// `their_index`) is at least as up-to-date as this one.
    ///
    /// Later-term last record wins; same term, longer log wins.
    #[must_use]
    pub fn candidate_up_to_date(&self, their_term: TermId, their_index: LogIndex) -> bool {
        let my_term = self.last_term();
        their_term > my_term || (their_term == my_term && their_index >= self.last_index())
    }
}
