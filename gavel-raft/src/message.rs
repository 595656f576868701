//! Peer RPC message types.
//!
//! Requests and responses are distinct variants rather than a shared tag
//! with a response flag, so dispatch is exhaustive at the type level.
//! Every message carries its sender, its term and a per-destination
//! message number; responses echo the number of the request they answer.

use gavel_core::{LogIndex, MsgSeq, NodeId, TermId};

use crate::LogRecord;

/// A message exchanged between cluster peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Replication / heartbeat request from a leader.
    AppendEntries(AppendEntriesRequest),
    /// A follower's verdict on an `AppendEntries` request.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Vote solicitation from a candidate.
    RequestVote(RequestVoteRequest),
    /// A voter's verdict on a `RequestVote` request.
    RequestVoteResponse(RequestVoteResponse),
    /// Reserved for log-compaction transfer; currently ignored by receivers.
    Snapshot(SnapshotRequest),
}

impl Message {
    /// Returns the sender of this message.
    #[must_use]
    pub const fn from(&self) -> NodeId {
        match self {
            Self::AppendEntries(r) => r.leader_id,
            Self::AppendEntriesResponse(r) => r.from,
            Self::RequestVote(r) => r.candidate_id,
            Self::RequestVoteResponse(r) => r.from,
            Self::Snapshot(r) => r.from,
        }
    }

    /// Returns the term this message was sent in.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesResponse(r) => r.term,
            Self::RequestVote(r) => r.term,
            Self::RequestVoteResponse(r) => r.term,
            Self::Snapshot(r) => r.term,
        }
    }

    /// Returns the message number.
    #[must_use]
    pub const fn seq(&self) -> MsgSeq {
        match self {
            Self::AppendEntries(r) => r.seq,
            Self::AppendEntriesResponse(r) => r.seq,
            Self::RequestVote(r) => r.seq,
            Self::RequestVoteResponse(r) => r.seq,
            Self::Snapshot(r) => r.seq,
        }
    }

    /// Returns true for request variants (messages that expect an answer).
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Self::AppendEntries(_) | Self::RequestVote(_) | Self::Snapshot(_)
        )
    }
}

/// `AppendEntries` RPC request. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: TermId,
    /// The leader sending this request.
    pub leader_id: NodeId,
    /// Per-destination message number.
    pub seq: MsgSeq,
    /// Index of the record immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the record at `prev_log_index`.
    pub prev_log_term: TermId,
    /// Records to replicate (empty for a pure heartbeat).
    pub entries: Vec<LogRecord>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Returns true if this request carries no records.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `AppendEntries` RPC response.
///
/// Carries no match index: the leader reconciles a success against its own
/// `last_sent` for the responding peer. The commit and applied cursors are
/// included for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Responder's current term, for the leader to update itself.
    pub term: TermId,
    /// The responding node.
    pub from: NodeId,
    /// Message number of the request being answered.
    pub seq: MsgSeq,
    /// True if the responder's log matched at (`prev_log_index`, `prev_log_term`).
    pub success: bool,
    /// Responder's commit index.
    pub commit_index: LogIndex,
    /// Responder's applied cursor.
    pub last_applied: LogIndex,
}

/// `RequestVote` RPC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: TermId,
    /// The candidate soliciting the vote.
    pub candidate_id: NodeId,
    /// Per-destination message number.
    pub seq: MsgSeq,
    /// Index of the candidate's last log record.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log record.
    pub last_log_term: TermId,
}

/// `RequestVote` RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Voter's current term.
    pub term: TermId,
    /// The responding node.
    pub from: NodeId,
    /// Message number of the request being answered.
    pub seq: MsgSeq,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

/// Reserved snapshot-transfer request. The wire format and dispatch slot
/// exist; no sender produces it and receivers ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Sender's term.
    pub term: TermId,
    /// The sending node.
    pub from: NodeId,
    /// Per-destination message number.
    pub seq: MsgSeq,
}
