//! Fatal consensus faults.
//!
//! Non-fatal protocol conditions (stale terms, duplicate messages, log
//! mismatches) are handled inside the protocol and never surface as errors.
//! The variants here are invariant violations: the node that observes one
//! must log it and stop.

use thiserror::Error;

use crate::{LogIndex, NodeId, TermId};

/// An unrecoverable violation of a consensus invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusFault {
    /// A log truncation would move the applied cursor backwards. Entries
    /// behind `last_applied` are committed on a majority and must never be
    /// rewritten.
    #[error("applied cursor would regress from {last_applied} to {clamped} after truncation")]
    AppliedRegressed {
        /// The applied cursor before the truncation.
        last_applied: LogIndex,
        /// Where the truncation would force it.
        clamped: LogIndex,
    },

    /// Two nodes acted as leader in the same term.
    #[error("duplicate leader in {term}: this node is leader but {claimant} also claims the term")]
    DuplicateLeader {
        /// The term with two claimants.
        term: TermId,
        /// The other node claiming leadership.
        claimant: NodeId,
    },
}
