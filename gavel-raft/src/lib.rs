//! Gavel Raft - the consensus core of the Gavel cluster.
//!
//! This crate implements the per-node consensus state machine: leader
//! election with randomized timeouts, log replication with conflict repair,
//! majority commit arithmetic and the ordered hand-off of committed
//! commands to the applier.
//!
//! The state machine is pure: it performs no I/O and takes no locks. Inputs
//! are inbound RPCs, timer firings and command submissions; effects come
//! back as [`RaftOutput`] values for the runtime to execute. Fatal
//! invariant violations come back as [`gavel_core::ConsensusFault`]. This
//! keeps the hard part deterministic and lets tests drive whole clusters
//! in-process without sockets or clocks.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod config;
mod log;
mod message;
mod node;
mod submit;

pub use config::RaftConfig;
pub use log::{LogRecord, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, RequestVoteRequest, RequestVoteResponse,
    SnapshotRequest,
};
pub use node::{RaftNode, RaftOutput, Role};
pub use submit::{CommitNotifier, CommitOutcome, CommitReceipt, PendingCommits, SubmitError};
