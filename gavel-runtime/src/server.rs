//! The node driver.
//!
//! One task owns the consensus state machine and serializes everything
//! that touches it: client submissions, inbound peer messages and timer
//! firings all arrive through channels and are handled to completion, one
//! at a time. The applier runs inline, so an inbound RPC can never
//! interleave with a half-applied record.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use gavel_core::limits::HANDLER_QUEUE_DEPTH;
use gavel_core::{Command, CommandKind, LogIndex, NodeId, TermId};
use gavel_raft::{
    CommitOutcome, CommitReceipt, Message, RaftNode, RaftOutput, Role, SubmitError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::{CommandBackend, DisabledBackend};
use crate::config::NodeConfig;
use crate::timer::{TimerEvent, TimerService};
use crate::transport::{Transport, TransportConfig, TransportError, TransportHandle};

/// Requests into the node driver.
#[derive(Debug)]
pub enum NodeCommand {
    /// Submit a client command for replication.
    Submit {
        /// The command.
        command: Command,
        /// Channel for the immediate verdict (a receipt, or not-leader).
        reply: oneshot::Sender<Result<CommitReceipt, SubmitError>>,
    },
    /// Query node state.
    Status {
        /// Channel for the answer.
        reply: oneshot::Sender<NodeStatus>,
    },
    /// Deliver a peer message (used when wiring nodes without TCP).
    Peer(Message),
    /// Stop the node.
    Shutdown,
}

/// A snapshot of node state for the router and for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    /// This node's ID.
    pub node_id: NodeId,
    /// Current role.
    pub role: Role,
    /// Current term.
    pub term: TermId,
    /// The node currently believed to be leader.
    pub leader_id: Option<NodeId>,
    /// Highest committed index.
    pub commit_index: LogIndex,
    /// Highest applied index.
    pub last_applied: LogIndex,
    /// Number of records in the log.
    pub log_len: u64,
}

/// Notifications for the client-facing request router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// This node became leader.
    BecameLeader,
    /// This node lost leadership.
    SteppedDown,
    /// Leadership may have changed; client sessions must be disconnected.
    SessionsReset,
    /// A record was committed and applied.
    Committed {
        /// The record's log index.
        index: LogIndex,
        /// The command kind that was applied.
        kind: CommandKind,
    },
}

/// Driver-level errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The node is not running.
    #[error("node unavailable")]
    Unavailable,
    /// The node is not the leader.
    #[error(transparent)]
    NotLeader(#[from] SubmitError),
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Transport startup failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Handle for interacting with a running node.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    /// Submits a command, returning a receipt that resolves when the
    /// command commits and is applied.
    ///
    /// # Errors
    /// `ServerError::NotLeader` (with a leader hint) when this node cannot
    /// accept commands; `ServerError::Unavailable` when the node stopped.
    pub async fn submit(
        &self,
        kind: CommandKind,
        payload: Bytes,
    ) -> Result<CommitReceipt, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Submit {
                command: Command::new(kind, payload),
                reply: tx,
            })
            .await
            .map_err(|_| ServerError::Unavailable)?;

        let verdict = rx.await.map_err(|_| ServerError::Unavailable)?;
        Ok(verdict?)
    }

    /// Returns a snapshot of node state.
    ///
    /// # Errors
    /// `ServerError::Unavailable` when the node stopped.
    pub async fn status(&self) -> Result<NodeStatus, ServerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Status { reply: tx })
            .await
            .map_err(|_| ServerError::Unavailable)?;
        rx.await.map_err(|_| ServerError::Unavailable)
    }

    /// Delivers a peer message directly (used when wiring nodes without
    /// TCP).
    ///
    /// # Errors
    /// `ServerError::Unavailable` when the node stopped.
    pub async fn peer_message(&self, message: Message) -> Result<(), ServerError> {
        self.commands
            .send(NodeCommand::Peer(message))
            .await
            .map_err(|_| ServerError::Unavailable)
    }

    /// Stops the node.
    ///
    /// # Errors
    /// `ServerError::Unavailable` when the node already stopped.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.commands
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| ServerError::Unavailable)
    }
}

/// Something the driver must react to.
enum Input {
    Command(Option<NodeCommand>),
    Peer(Message),
    Timer(Option<TimerEvent>),
}

/// The fatal-stop marker: the loop logs the cause before raising it.
struct Stop;

/// The node driver: owns the state machine, its timers and the applier.
pub struct NodeRuntime {
    node: RaftNode,
    timers: TimerService,
    timer_rx: mpsc::Receiver<TimerEvent>,
    backend: Arc<dyn CommandBackend>,
    events: mpsc::Sender<NodeEvent>,
    transport: Option<TransportHandle>,
}

impl NodeRuntime {
    /// Creates a driver for `config`, applying committed commands to
    /// `backend` and reporting [`NodeEvent`]s on `events`.
    #[must_use]
    pub fn new(
        config: &NodeConfig,
        backend: Arc<dyn CommandBackend>,
        events: mpsc::Sender<NodeEvent>,
    ) -> Self {
        let raft_config = config.raft_config();
        let peers = raft_config.peers();
        let (timer_tx, timer_rx) = mpsc::channel(HANDLER_QUEUE_DEPTH);
        let timers = TimerService::new(config.timing.clone(), peers, timer_tx);

        let backend: Arc<dyn CommandBackend> = if config.disabled_backend {
            Arc::new(DisabledBackend)
        } else {
            backend
        };

        Self {
            node: RaftNode::new(raft_config),
            timers,
            timer_rx,
            backend,
            events,
            transport: None,
        }
    }

    /// Starts the driver, returning the handle and the future to spawn.
    ///
    /// `incoming` carries peer messages (from the transport, or from a
    /// test harness); `transport` carries outbound sends. Both are
    /// optional so nodes can run in isolation under test.
    pub fn run(
        mut self,
        incoming: Option<mpsc::Receiver<Message>>,
        transport: Option<TransportHandle>,
    ) -> (NodeHandle, impl std::future::Future<Output = ()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(HANDLER_QUEUE_DEPTH);
        self.transport = transport;
        let handle = NodeHandle { commands: cmd_tx };
        (handle, self.run_loop(cmd_rx, incoming))
    }

    async fn run_loop(
        mut self,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut incoming: Option<mpsc::Receiver<Message>>,
    ) {
        let outputs = self.node.startup();
        if self.process_outputs(outputs).await.is_err() {
            self.teardown().await;
            return;
        }

        loop {
            let input = tokio::select! {
                cmd = commands.recv() => Input::Command(cmd),
                Some(message) = recv_or_pending(&mut incoming) => Input::Peer(message),
                event = self.timer_rx.recv() => Input::Timer(event),
            };

            let result = match input {
                Input::Command(None | Some(NodeCommand::Shutdown)) => {
                    info!(node_id = self.node.node_id().get(), "node shutting down");
                    break;
                }
                Input::Command(Some(NodeCommand::Submit { command, reply })) => {
                    self.handle_submit(command, reply).await
                }
                Input::Command(Some(NodeCommand::Status { reply })) => {
                    let _ = reply.send(self.status());
                    Ok(())
                }
                Input::Command(Some(NodeCommand::Peer(message))) | Input::Peer(message) => {
                    self.handle_peer_message(message).await
                }
                Input::Timer(None) => break,
                Input::Timer(Some(event)) => self.handle_timer(event).await,
            };

            if result.is_err() {
                break;
            }
        }

        self.teardown().await;
    }

    async fn handle_submit(
        &mut self,
        command: Command,
        reply: oneshot::Sender<Result<CommitReceipt, SubmitError>>,
    ) -> Result<(), Stop> {
        match self.node.submit(command) {
            Ok((receipt, outputs)) => {
                let _ = reply.send(Ok(receipt));
                self.process_outputs(outputs).await
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                Ok(())
            }
        }
    }

    async fn handle_peer_message(&mut self, message: Message) -> Result<(), Stop> {
        match self.node.handle_message(message) {
            Ok(outputs) => self.process_outputs(outputs).await,
            Err(fault) => {
                error!(
                    node_id = self.node.node_id().get(),
                    fault = %fault,
                    "consensus invariant violated, stopping node"
                );
                Err(Stop)
            }
        }
    }

    async fn handle_timer(&mut self, event: TimerEvent) -> Result<(), Stop> {
        let outputs = match event {
            TimerEvent::Leader => self.node.handle_leader_timeout(Instant::now()),
            TimerEvent::Election => self.node.handle_election_timeout(Instant::now()),
            TimerEvent::Heartbeat(peer) => self.node.handle_heartbeat_timeout(peer),
        };
        self.process_outputs(outputs).await
    }

    /// Executes state-machine outputs in order. The applier runs here:
    /// each committed record is fed to the back end and awaited before the
    /// next output is touched.
    async fn process_outputs(&mut self, outputs: Vec<RaftOutput>) -> Result<(), Stop> {
        for output in outputs {
            match output {
                RaftOutput::Send { to, message } => {
                    if let Some(transport) = &self.transport {
                        if let Err(e) = transport.send(to, message).await {
                            // Message loss; the heartbeat cycle retries.
                            debug!(to = to.get(), error = %e, "send failed");
                        }
                    } else {
                        debug!(to = to.get(), "no transport, dropping outbound message");
                    }
                }
                RaftOutput::ArmLeaderTimer => self.timers.arm_leader(),
                RaftOutput::CancelLeaderTimer => self.timers.cancel_leader(),
                RaftOutput::ArmElectionTimer => self.timers.arm_election(),
                RaftOutput::CancelElectionTimer => self.timers.cancel_election(),
                RaftOutput::ArmHeartbeat(peer) => self.timers.arm_heartbeat(peer),
                RaftOutput::ArmAllHeartbeats => self.timers.arm_all_heartbeats(),
                RaftOutput::CancelHeartbeats => self.timers.cancel_heartbeats(),
                RaftOutput::Apply {
                    index,
                    command,
                    notify,
                } => {
                    let kind = command.kind;
                    match self.backend.apply(kind, command.payload).await {
                        Ok(result) => {
                            if let Some(notify) = notify {
                                notify.resolve(CommitOutcome::Applied { index, result });
                            }
                            let _ = self.events.send(NodeEvent::Committed { index, kind }).await;
                        }
                        Err(e) => {
                            // A committed record that cannot be applied is
                            // unrecoverable here.
                            error!(
                                node_id = self.node.node_id().get(),
                                index = index.get(),
                                kind = %kind,
                                error = %e,
                                "backend failed, stopping node"
                            );
                            return Err(Stop);
                        }
                    }
                }
                RaftOutput::BecameLeader => {
                    info!(
                        node_id = self.node.node_id().get(),
                        term = self.node.current_term().get(),
                        "became leader"
                    );
                    let _ = self.events.send(NodeEvent::BecameLeader).await;
                }
                RaftOutput::SteppedDown => {
                    warn!(
                        node_id = self.node.node_id().get(),
                        term = self.node.current_term().get(),
                        "stepped down"
                    );
                    let _ = self.events.send(NodeEvent::SteppedDown).await;
                }
                RaftOutput::SessionsReset => {
                    let _ = self.events.send(NodeEvent::SessionsReset).await;
                }
            }
        }
        Ok(())
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.node_id(),
            role: self.node.role(),
            term: self.node.current_term(),
            leader_id: self.node.leader_id(),
            commit_index: self.node.commit_index(),
            last_applied: self.node.last_applied(),
            log_len: self.node.log().len(),
        }
    }

    async fn teardown(&mut self) {
        self.node.shutdown();
        self.timers.cancel_all();
        if let Some(transport) = &self.transport {
            transport.shutdown().await;
        }
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Builds the transport and driver for `config` and spawns the node.
///
/// Returns the handle and the router's event stream. When
/// `config.disabled_backend` is set the given back end is ignored.
///
/// # Errors
/// Configuration or transport-bind failures.
pub async fn start_node(
    config: &NodeConfig,
    backend: Arc<dyn CommandBackend>,
) -> Result<(NodeHandle, mpsc::Receiver<NodeEvent>), ServerError> {
    config.validate().map_err(ServerError::InvalidConfig)?;

    let mut transport_config = TransportConfig::new(config.node_id, config.protocol_addr);
    for peer in &config.peers {
        transport_config = transport_config.with_peer(peer.node_id, peer.addr.clone());
    }
    let (transport, incoming) = Transport::new(transport_config);
    let transport = transport.start().await?;

    let (events_tx, events_rx) = mpsc::channel(HANDLER_QUEUE_DEPTH);
    let runtime = NodeRuntime::new(config, backend, events_tx);
    let (handle, future) = runtime.run(Some(incoming), Some(transport));
    tokio::spawn(future);

    Ok((handle, events_rx))
}
