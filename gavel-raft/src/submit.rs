//! Commit receipts for submitted commands.
//!
//! The leader hands the submitter a one-shot receipt that resolves when the
//! command commits and is applied (or when leadership is lost first). Only
//! the originating leader holds the sending half; replicated records carry
//! nothing.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use gavel_core::{LogIndex, NodeId};
use tokio::sync::oneshot;

/// Why a submission was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// This node is not the leader.
    NotLeader {
        /// The leader this node currently believes in, if any.
        hint: Option<NodeId>,
    },
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLeader { hint: Some(id) } => write!(f, "not leader; try {id}"),
            Self::NotLeader { hint: None } => write!(f, "not leader"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// The final outcome of a submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The command committed and was applied by the back end.
    Applied {
        /// The log index the command committed at.
        index: LogIndex,
        /// The back end's result, if it produced one.
        result: Option<Bytes>,
    },
    /// Leadership was lost before the command committed. The command may
    /// still commit under a later leader; the submitter must retry through
    /// the hinted node to find out.
    NotLeader {
        /// The new leader, if known.
        hint: Option<NodeId>,
    },
}

/// The sending half of a commit receipt, held by the originating leader.
#[derive(Debug)]
pub struct CommitNotifier {
    tx: oneshot::Sender<CommitOutcome>,
}

impl CommitNotifier {
    /// Resolves the receipt. A submitter that dropped its receipt is fine.
    pub fn resolve(self, outcome: CommitOutcome) {
        let _ = self.tx.send(outcome);
    }
}

/// The receiving half handed back to the submitter.
#[derive(Debug)]
pub struct CommitReceipt {
    rx: oneshot::Receiver<CommitOutcome>,
}

impl CommitReceipt {
    /// Creates a connected notifier/receipt pair.
    #[must_use]
    pub fn pair() -> (CommitNotifier, Self) {
        let (tx, rx) = oneshot::channel();
        (CommitNotifier { tx }, Self { rx })
    }

    /// Waits for the outcome. A node that shut down before resolving reads
    /// as a leaderless rejection.
    pub async fn wait(self) -> CommitOutcome {
        self.rx
            .await
            .unwrap_or(CommitOutcome::NotLeader { hint: None })
    }
}

/// Leader-side table of unresolved receipts, keyed by log index.
#[derive(Debug, Default)]
pub struct PendingCommits {
    by_index: HashMap<LogIndex, CommitNotifier>,
}

impl PendingCommits {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_index: HashMap::new(),
        }
    }

    /// Registers a notifier for the record at `index`.
    pub fn register(&mut self, index: LogIndex, notifier: CommitNotifier) {
        self.by_index.insert(index, notifier);
    }

    /// Removes and returns the notifier for `index`, if this node
    /// originated that record.
    pub fn take(&mut self, index: LogIndex) -> Option<CommitNotifier> {
        self.by_index.remove(&index)
    }

    /// Resolves every outstanding receipt with a not-leader outcome.
    /// Called on step-down.
    pub fn flush_not_leader(&mut self, hint: Option<NodeId>) {
        for (_, notifier) in self.by_index.drain() {
            notifier.resolve(CommitOutcome::NotLeader { hint });
        }
    }

    /// Returns the number of unresolved receipts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Returns true if no receipts are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}
