//! The per-node consensus state machine.
//!
//! `RaftNode` is pure: inputs are inbound peer messages, timer firings and
//! command submissions; every effect (sends, timer arming, applier
//! invocations, router notifications) is returned as a [`RaftOutput`] for
//! the runtime to execute in order. Fatal invariant violations are returned
//! as [`ConsensusFault`] and must stop the node.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use gavel_core::limits::MAX_ENTRIES_PER_APPEND;
use gavel_core::{Command, ConsensusFault, LogIndex, MsgSeq, NodeId, TermId};
use tracing::{debug, warn};

use crate::log::{LogRecord, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
use crate::submit::{CommitNotifier, CommitReceipt, PendingCommits, SubmitError};
use crate::RaftConfig;

/// The role a node currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Passive; accepts replication from the current leader.
    #[default]
    Follower,
    /// Soliciting votes for a new term.
    Candidate,
    /// Orders and replicates client commands for its term.
    Leader,
}

/// An effect requested by the state machine.
///
/// Outputs must be executed in the order they were produced.
#[derive(Debug)]
pub enum RaftOutput {
    /// Send a message to a peer.
    Send {
        /// Destination peer.
        to: NodeId,
        /// The message.
        message: Message,
    },
    /// Arm the leader timer with a fresh random interval.
    ArmLeaderTimer,
    /// Cancel the leader timer.
    CancelLeaderTimer,
    /// Arm the election timer with a fresh random interval.
    ArmElectionTimer,
    /// Cancel the election timer.
    CancelElectionTimer,
    /// Cancel and re-arm the heartbeat timer for one peer.
    ArmHeartbeat(NodeId),
    /// Cancel and re-arm the heartbeat timers for every peer.
    ArmAllHeartbeats,
    /// Cancel every heartbeat timer.
    CancelHeartbeats,
    /// Feed a committed record to the back end, in index order. `notify`
    /// is present only on the node that originated the record.
    Apply {
        /// The record's log index.
        index: LogIndex,
        /// The committed command.
        command: Command,
        /// Receipt to resolve with the back end's result.
        notify: Option<CommitNotifier>,
    },
    /// This node won an election.
    BecameLeader,
    /// This node lost leadership.
    SteppedDown,
    /// Leadership may have changed; the request router must disconnect
    /// client sessions.
    SessionsReset,
}

/// A consensus node.
///
/// Two nodes are independently constructible in one process; there is no
/// global state.
#[derive(Debug)]
pub struct RaftNode {
    config: RaftConfig,

    // Persistent-intent state.
    current_term: TermId,
    voted_for: Option<NodeId>,
    log: RaftLog,

    // Volatile state.
    role: Role,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,
    /// Highest AppendEntries message number accepted from the current
    /// leader; resets on term change.
    last_seen_seq: Option<MsgSeq>,

    // Candidate state.
    votes_received: HashSet<NodeId>,
    last_election_started: Option<Instant>,

    // Leader state, reinitialized on election win.
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    last_sent: HashMap<NodeId, LogIndex>,
    msg_seq: HashMap<NodeId, MsgSeq>,
    pending: PendingCommits,
}

impl RaftNode {
    /// Creates a new node in the follower role.
    #[must_use]
    pub fn new(config: RaftConfig) -> Self {
        Self {
            config,
            current_term: TermId::new(0),
            voted_for: None,
            log: RaftLog::new(),
            role: Role::Follower,
            commit_index: LogIndex::NONE,
            last_applied: LogIndex::NONE,
            leader_id: None,
            last_seen_seq: None,
            votes_received: HashSet::new(),
            last_election_started: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_sent: HashMap::new(),
            msg_seq: HashMap::new(),
            pending: PendingCommits::new(),
        }
    }

    /// Returns this node's ID.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns true if this node is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> TermId {
        self.current_term
    }

    /// Returns the node this one believes is leader, if any.
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the applied cursor.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the log.
    #[must_use]
    pub const fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Effects to execute when the node starts: a follower waits for
    /// leader traffic.
    #[must_use]
    pub fn startup(&mut self) -> Vec<RaftOutput> {
        vec![RaftOutput::ArmLeaderTimer]
    }

    /// Effects to execute when the node stops: resolve outstanding
    /// receipts so submitters do not hang.
    pub fn shutdown(&mut self) {
        self.pending.flush_not_leader(None);
    }

    // ---- submission ----

    /// Accepts a client command (leader only).
    ///
    /// The record is appended locally; the regular heartbeat / response
    /// cycle replicates and ultimately commits it, at which point the
    /// returned receipt resolves with the back end's result.
    ///
    /// # Errors
    /// `SubmitError::NotLeader` with a leader hint when this node cannot
    /// accept commands.
    pub fn submit(
        &mut self,
        command: Command,
    ) -> Result<(CommitReceipt, Vec<RaftOutput>), SubmitError> {
        if self.role != Role::Leader {
            return Err(SubmitError::NotLeader {
                hint: self.leader_id,
            });
        }

        let index = self.log.last_index().next();
        self.log
            .append(LogRecord::new(self.current_term, index, command));

        let (notifier, receipt) = CommitReceipt::pair();
        self.pending.register(index, notifier);

        // A single-node cluster has its majority already.
        let mut outputs = Vec::new();
        self.try_advance_commit(&mut outputs);

        Ok((receipt, outputs))
    }

    // ---- timers ----

    /// The leader timer fired: no leader traffic arrived in time.
    #[must_use]
    pub fn handle_leader_timeout(&mut self, now: Instant) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.role != Role::Follower {
            return outputs;
        }
        self.start_election(now, &mut outputs);
        outputs
    }

    /// The election timer fired: the current election reached no verdict.
    #[must_use]
    pub fn handle_election_timeout(&mut self, now: Instant) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        if self.role != Role::Candidate {
            return outputs;
        }

        // Elections fired too soon after the previous one started are
        // suppressed; the re-armed timer tries again.
        if let Some(started) = self.last_election_started {
            if now.duration_since(started) < self.config.min_election_delay {
                debug!(node_id = self.config.node_id.get(), "election suppressed");
                outputs.push(RaftOutput::ArmElectionTimer);
                return outputs;
            }
        }

        self.start_election(now, &mut outputs);
        outputs
    }

    /// The heartbeat timer for `peer` fired.
    #[must_use]
    pub fn handle_heartbeat_timeout(&mut self, peer: NodeId) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        match self.role {
            Role::Leader => {
                self.send_append_entries(peer, &mut outputs);
                outputs.push(RaftOutput::ArmHeartbeat(peer));
            }
            Role::Candidate => {
                self.send_request_vote(peer, &mut outputs);
                outputs.push(RaftOutput::ArmHeartbeat(peer));
            }
            // A fire that raced its cancellation.
            Role::Follower => {}
        }
        outputs
    }

    // ---- inbound messages ----

    /// Handles one inbound peer message.
    ///
    /// # Errors
    /// A [`ConsensusFault`] means an invariant was violated; the caller
    /// must log it and stop the node.
    pub fn handle_message(&mut self, message: Message) -> Result<Vec<RaftOutput>, ConsensusFault> {
        let mut outputs = Vec::new();

        // Term-bump rule: runs first on every inbound message.
        if message.term() > self.current_term {
            self.bump_term(&message, &mut outputs);
        }

        match message {
            Message::AppendEntries(req) => self.handle_append_entries(req, &mut outputs)?,
            Message::AppendEntriesResponse(resp) => self.handle_append_response(&resp, &mut outputs),
            Message::RequestVote(req) => self.handle_request_vote(&req, &mut outputs),
            Message::RequestVoteResponse(resp) => self.handle_vote_response(&resp, &mut outputs),
            Message::Snapshot(req) => {
                // Reserved RPC; nothing implements it yet.
                debug!(
                    node_id = self.config.node_id.get(),
                    from = req.from.get(),
                    "ignoring snapshot message"
                );
            }
        }

        Ok(outputs)
    }

    /// Adopts a newer term and falls back to follower.
    fn bump_term(&mut self, message: &Message, outputs: &mut Vec<RaftOutput>) {
        let was_leader = self.role == Role::Leader;

        match self.role {
            Role::Leader => outputs.push(RaftOutput::CancelHeartbeats),
            Role::Candidate => {
                outputs.push(RaftOutput::CancelHeartbeats);
                outputs.push(RaftOutput::CancelElectionTimer);
            }
            Role::Follower => {}
        }

        self.role = Role::Follower;
        self.current_term = message.term();
        self.voted_for = None;
        self.votes_received.clear();
        self.last_seen_seq = None;

        // Only a replication request names the term's leader.
        self.leader_id = match message {
            Message::AppendEntries(req) => Some(req.leader_id),
            _ => None,
        };

        self.pending.flush_not_leader(self.leader_id);
        if was_leader {
            outputs.push(RaftOutput::SteppedDown);
        }

        outputs.push(RaftOutput::ArmLeaderTimer);
        // Client sessions pinned to this node may now be talking to the
        // wrong leader.
        outputs.push(RaftOutput::SessionsReset);
    }

    fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
        outputs: &mut Vec<RaftOutput>,
    ) -> Result<(), ConsensusFault> {
        if req.term < self.current_term {
            // Stale leader; our term in the reply will bump it.
            outputs.push(self.append_response(req.leader_id, req.seq, false));
            return Ok(());
        }

        match self.role {
            Role::Leader => {
                // Same term, two leaders: I3 is broken.
                return Err(ConsensusFault::DuplicateLeader {
                    term: self.current_term,
                    claimant: req.leader_id,
                });
            }
            Role::Candidate => {
                // A leader emerged for the term we are campaigning in.
                outputs.push(RaftOutput::CancelHeartbeats);
                outputs.push(RaftOutput::CancelElectionTimer);
                self.role = Role::Follower;
                self.votes_received.clear();
                self.leader_id = Some(req.leader_id);
                self.last_seen_seq = None;
            }
            Role::Follower => {}
        }

        // Duplicate or reordered delivery.
        if let Some(last) = self.last_seen_seq {
            if req.seq <= last {
                debug!(
                    node_id = self.config.node_id.get(),
                    seq = req.seq.get(),
                    "dropping stale append"
                );
                return Ok(());
            }
        }

        // Leader identity check.
        match self.leader_id {
            None => self.leader_id = Some(req.leader_id),
            Some(known) if known != req.leader_id => {
                warn!(
                    node_id = self.config.node_id.get(),
                    known = known.get(),
                    claimant = req.leader_id.get(),
                    term = self.current_term.get(),
                    "ignoring append from second leader claimant"
                );
                return Ok(());
            }
            Some(_) => {}
        }

        // Log match check: the record before `entries` must be present
        // with the right term.
        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            outputs.push(self.append_response(req.leader_id, req.seq, false));
            outputs.push(RaftOutput::ArmLeaderTimer);
            return Ok(());
        }

        // Conflict repair and append.
        for entry in req.entries {
            if self.log.get(entry.index).is_some() {
                if self.log.term_at(entry.index) != entry.term {
                    self.truncate_and_clamp(entry.index.prev())?;
                    self.log.append(entry);
                }
                // Same (index, term): already replicated, keep it.
            } else {
                self.log.append(entry);
            }
        }

        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(self.log.last_index());
            self.advance_commit(new_commit, outputs);
        }

        self.last_seen_seq = Some(req.seq);
        outputs.push(self.append_response(req.leader_id, req.seq, true));
        outputs.push(RaftOutput::ArmLeaderTimer);
        Ok(())
    }

    fn handle_append_response(
        &mut self,
        resp: &AppendEntriesResponse,
        outputs: &mut Vec<RaftOutput>,
    ) {
        if self.role != Role::Leader || resp.term != self.current_term {
            return;
        }
        let peer = resp.from;

        if resp.success {
            // The response carries no match index; everything we last sent
            // this peer is now known replicated.
            let sent = self.last_sent.get(&peer).copied().unwrap_or(LogIndex::NONE);
            self.match_index.insert(peer, sent);
            self.next_index.insert(peer, sent.next());

            self.try_advance_commit(outputs);

            // Ship any records appended since the last send right away.
            let next = self.next_index.get(&peer).copied().unwrap_or(LogIndex::NONE);
            if next != LogIndex::NONE && self.log.last_index() >= next {
                self.send_append_entries(peer, outputs);
                outputs.push(RaftOutput::ArmHeartbeat(peer));
            }
        } else {
            // Log mismatch: back off one index and let the next heartbeat
            // retry from there.
            let next = self
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or_else(|| self.log.last_index().next());
            if next > LogIndex::new(1) {
                self.next_index.insert(peer, next.prev());
            }
            outputs.push(RaftOutput::ArmHeartbeat(peer));
        }
    }

    fn handle_request_vote(&mut self, req: &RequestVoteRequest, outputs: &mut Vec<RaftOutput>) {
        let granted = if req.term < self.current_term {
            false
        } else {
            let can_vote = match self.voted_for {
                None => true,
                Some(id) => id == req.candidate_id,
            };
            can_vote
                && self
                    .log
                    .candidate_up_to_date(req.last_log_term, req.last_log_index)
        };

        if granted {
            self.voted_for = Some(req.candidate_id);
            outputs.push(RaftOutput::ArmLeaderTimer);
        }

        outputs.push(RaftOutput::Send {
            to: req.candidate_id,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: self.current_term,
                from: self.config.node_id,
                seq: req.seq,
                vote_granted: granted,
            }),
        });
    }

    fn handle_vote_response(&mut self, resp: &RequestVoteResponse, outputs: &mut Vec<RaftOutput>) {
        if self.role != Role::Candidate || resp.term != self.current_term {
            return;
        }

        if resp.vote_granted {
            self.votes_received.insert(resp.from);
            if self.votes_received.len() >= self.config.quorum_size() {
                self.become_leader(outputs);
            }
        }
    }

    // ---- elections ----

    fn start_election(&mut self, now: Instant, outputs: &mut Vec<RaftOutput>) {
        outputs.push(RaftOutput::CancelLeaderTimer);

        self.role = Role::Candidate;
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.config.node_id);
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);
        self.leader_id = None;
        self.last_seen_seq = None;
        self.last_election_started = Some(now);

        debug!(
            node_id = self.config.node_id.get(),
            term = self.current_term.get(),
            "starting election"
        );

        for peer in self.config.peers() {
            self.send_request_vote(peer, outputs);
        }
        outputs.push(RaftOutput::ArmElectionTimer);
        // Heartbeats retransmit the vote request to slow peers.
        outputs.push(RaftOutput::ArmAllHeartbeats);

        // A single-node cluster is its own majority.
        if self.votes_received.len() >= self.config.quorum_size() {
            self.become_leader(outputs);
        }
    }

    fn become_leader(&mut self, outputs: &mut Vec<RaftOutput>) {
        self.role = Role::Leader;
        self.leader_id = Some(self.config.node_id);

        let last = self.log.last_index();
        for peer in self.config.peers() {
            self.next_index.insert(peer, last.next());
            self.match_index.insert(peer, LogIndex::NONE);
            self.last_sent.insert(peer, last);
            self.msg_seq.insert(peer, MsgSeq::new(0));
        }

        outputs.push(RaftOutput::BecameLeader);
        outputs.push(RaftOutput::CancelElectionTimer);

        // Announce immediately with an empty AppendEntries round.
        for peer in self.config.peers() {
            self.send_append_entries(peer, outputs);
        }
        outputs.push(RaftOutput::ArmAllHeartbeats);
    }

    // ---- replication ----

    /// Sends the tail of the log from `next_index[peer]` (empty when the
    /// peer is caught up) and records what was covered in `last_sent`.
    fn send_append_entries(&mut self, peer: NodeId, outputs: &mut Vec<RaftOutput>) {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or_else(|| self.log.last_index().next());
        let prev = next.prev();
        let prev_term = self.log.term_at(prev);
        let entries = self.log.slice_from(next, MAX_ENTRIES_PER_APPEND);
        let sent_through = entries.last().map_or(prev, |r| r.index);

        self.last_sent.insert(peer, sent_through);
        let seq = self.next_seq(peer);

        outputs.push(RaftOutput::Send {
            to: peer,
            message: Message::AppendEntries(AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.config.node_id,
                seq,
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.commit_index,
            }),
        });
    }

    fn send_request_vote(&mut self, peer: NodeId, outputs: &mut Vec<RaftOutput>) {
        let seq = self.next_seq(peer);
        outputs.push(RaftOutput::Send {
            to: peer,
            message: Message::RequestVote(RequestVoteRequest {
                term: self.current_term,
                candidate_id: self.config.node_id,
                seq,
                last_log_index: self.log.last_index(),
                last_log_term: self.log.last_term(),
            }),
        });
    }

    /// Returns the message number for the next request to `peer` and
    /// advances the counter.
    fn next_seq(&mut self, peer: NodeId) -> MsgSeq {
        let seq = self.msg_seq.get(&peer).copied().unwrap_or_default();
        self.msg_seq.insert(peer, seq.next());
        seq
    }

    /// Advances the commit index to the highest record replicated on a
    /// majority, counting this node at its own last index. Only records
    /// from the current term commit by counting.
    fn try_advance_commit(&mut self, outputs: &mut Vec<RaftOutput>) {
        if self.role != Role::Leader {
            return;
        }

        let quorum = self.config.quorum_size();
        let mut target = self.commit_index;

        for n in (self.commit_index.get() + 1)..=self.log.last_index().get() {
            let idx = LogIndex::new(n);
            if self.log.term_at(idx) != self.current_term {
                continue;
            }

            let mut count = 1; // self
            for peer in self.config.peers() {
                let matched = self.match_index.get(&peer).copied().unwrap_or(LogIndex::NONE);
                if matched >= idx {
                    count += 1;
                }
            }
            if count >= quorum {
                target = idx;
            }
        }

        if target > self.commit_index {
            self.advance_commit(target, outputs);
        }
    }

    /// Raises the commit index and emits `Apply` outputs for every newly
    /// committed record, in index order.
    fn advance_commit(&mut self, new_commit: LogIndex, outputs: &mut Vec<RaftOutput>) {
        if new_commit <= self.commit_index {
            return;
        }
        self.commit_index = new_commit;

        while self.last_applied < self.commit_index {
            let idx = self.last_applied.next();
            let Some(record) = self.log.get(idx) else {
                break;
            };
            let command = record.command.clone();
            let notify = self.pending.take(idx);
            outputs.push(RaftOutput::Apply {
                index: idx,
                command,
                notify,
            });
            self.last_applied = idx;
        }
    }

    /// Truncates the log and clamps the commit and applied cursors.
    fn truncate_and_clamp(&mut self, last_kept: LogIndex) -> Result<(), ConsensusFault> {
        self.log.truncate_to(last_kept);

        if self.commit_index > self.log.last_index() {
            self.commit_index = self.log.last_index();
        }
        if self.last_applied > self.commit_index {
            return Err(ConsensusFault::AppliedRegressed {
                last_applied: self.last_applied,
                clamped: self.commit_index,
            });
        }
        Ok(())
    }

    fn append_response(&self, to: NodeId, seq: MsgSeq, success: bool) -> RaftOutput {
        RaftOutput::Send {
            to,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                from: self.config.node_id,
                seq,
                success,
                commit_index: self.commit_index,
                last_applied: self.last_applied,
            }),
        }
    }
}
