//! TCP transport between cluster peers.
//!
//! Each peer pair keeps long-lived connections: outbound links are
//! established lazily on first send and reconnected with exponential
//! backoff, inbound links are accepted and authenticated. The first frame
//! on every outbound connection is a `Hello` naming the sender; the
//! acceptor drops connections whose `Hello` names an unknown peer.
//!
//! Delivery is best effort. A send that fails is message loss; the
//! consensus layer's heartbeat cycle is the retry path. The consensus core
//! only ever sees `send(peer, message)` and the inbound message channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use gavel_core::limits::SEND_QUEUE_DEPTH;
use gavel_core::NodeId;
use gavel_raft::Message;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{decode_frame, encode_frame, CodecError, Frame};

/// Read buffer size (1 MB).
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection timeout in milliseconds.
const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind the protocol listener.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to connect to a peer.
    #[error("failed to connect to peer {node_id} at {addr}: {source}")]
    ConnectFailed {
        /// The peer node ID.
        node_id: NodeId,
        /// The peer address.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is shut down.
    #[error("transport is shutdown")]
    Shutdown,

    /// The destination is not a configured peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// The peer's send queue is full.
    #[error("send queue full for peer {0}")]
    QueueFull(NodeId),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Configuration for a peer node.
#[derive(Debug, Clone)]
pub struct PeerAddr {
    /// The peer's node ID.
    pub node_id: NodeId,
    /// The peer's address (`host:port`, resolved at connect time).
    pub addr: String,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Known peers. Inbound connections from ids outside this set are
    /// rejected.
    pub peers: Vec<PeerAddr>,
}

impl TransportConfig {
    /// Creates a new transport configuration.
    #[must_use]
    pub const fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            peers: Vec::new(),
        }
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerAddr {
            node_id,
            addr: addr.into(),
        });
        self
    }
}

/// State of an outbound peer link.
struct PeerLink {
    /// Sender into the peer's outbound queue.
    sender: mpsc::Sender<Message>,
}

/// Handle for sending messages to peers.
#[derive(Clone)]
pub struct TransportHandle {
    node_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, PeerLink>>>,
    shutdown: Arc<Mutex<bool>>,
}

impl TransportHandle {
    /// Queues a message for a peer. Best effort: delivery is not
    /// guaranteed.
    ///
    /// # Errors
    /// Returns an error if the peer is unknown, the queue is full, or the
    /// transport is shut down.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn send(&self, to: NodeId, message: Message) -> TransportResult<()> {
        debug_assert!(to != self.node_id, "cannot send message to self");

        if *self.shutdown.lock().await {
            return Err(TransportError::Shutdown);
        }

        let peers = self.peers.read().await;
        let link = peers.get(&to).ok_or(TransportError::UnknownPeer(to))?;

        link.sender
            .try_send(message)
            .map_err(|_| TransportError::QueueFull(to))
    }

    /// Returns this transport's node ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Shuts the transport down: sender loops stop and peer links close.
    pub async fn shutdown(&self) {
        *self.shutdown.lock().await = true;
        self.peers.write().await.clear();
    }

    /// Returns true if the transport is shut down.
    pub async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }
}

/// TCP transport for the peer protocol.
pub struct Transport {
    config: TransportConfig,
    peers: Arc<RwLock<HashMap<NodeId, PeerLink>>>,
    incoming_tx: mpsc::Sender<Message>,
    shutdown: Arc<Mutex<bool>>,
}

impl Transport {
    /// Creates a new transport and the channel inbound messages arrive on.
    #[must_use]
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<Message>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);

        let transport = Self {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            incoming_tx,
            shutdown: Arc::new(Mutex::new(false)),
        };

        (transport, incoming_rx)
    }

    /// Starts the listener and the per-peer sender loops.
    ///
    /// # Errors
    /// Returns an error if binding fails.
    pub async fn start(self) -> TransportResult<TransportHandle> {
        let listener = create_reusable_listener(self.config.listen_addr).map_err(|e| {
            TransportError::BindFailed {
                addr: self.config.listen_addr,
                source: e,
            }
        })?;

        info!(
            node_id = self.config.node_id.get(),
            addr = %self.config.listen_addr,
            "transport listening"
        );

        let handle = TransportHandle {
            node_id: self.config.node_id,
            peers: Arc::clone(&self.peers),
            shutdown: Arc::clone(&self.shutdown),
        };

        for peer in &self.config.peers {
            self.spawn_sender(peer.node_id, peer.addr.clone()).await;
        }

        let allowed: HashSet<NodeId> = self.config.peers.iter().map(|p| p.node_id).collect();
        let accept_shutdown = Arc::clone(&self.shutdown);
        let accept_tx = self.incoming_tx.clone();
        let node_id = self.config.node_id;

        tokio::spawn(async move {
            Self::accept_loop(listener, accept_tx, accept_shutdown, node_id, allowed).await;
        });

        Ok(handle)
    }

    /// Registers a peer link and spawns its sender loop.
    async fn spawn_sender(&self, peer_id: NodeId, addr: String) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        {
            let mut peers = self.peers.write().await;
            peers.insert(peer_id, PeerLink { sender: tx });
        }

        let shutdown = Arc::clone(&self.shutdown);
        let node_id = self.config.node_id;

        tokio::spawn(async move {
            Self::sender_loop(node_id, peer_id, addr, rx, shutdown).await;
        });
    }

    /// Accepts inbound connections and spawns a receive loop per link.
    async fn accept_loop(
        listener: TcpListener,
        incoming_tx: mpsc::Sender<Message>,
        shutdown: Arc<Mutex<bool>>,
        node_id: NodeId,
        allowed: HashSet<NodeId>,
    ) {
        loop {
            if *shutdown.lock().await {
                info!(node_id = node_id.get(), "accept loop shutting down");
                break;
            }

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(
                        node_id = node_id.get(),
                        peer_addr = %peer_addr,
                        "accepted connection"
                    );

                    let tx = incoming_tx.clone();
                    let shutdown = Arc::clone(&shutdown);
                    let allowed = allowed.clone();

                    tokio::spawn(async move {
                        if let Err(e) = Self::receive_loop(stream, tx, shutdown, allowed).await {
                            debug!(peer_addr = %peer_addr, error = %e, "receive loop ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// Sends queued messages to one peer, reconnecting on failure.
    async fn sender_loop(
        node_id: NodeId,
        peer_id: NodeId,
        addr: String,
        mut rx: mpsc::Receiver<Message>,
        shutdown: Arc<Mutex<bool>>,
    ) {
        const MAX_RECONNECT_DELAY_MS: u64 = 10000;
        let mut stream: Option<TcpStream> = None;
        let mut reconnect_delay_ms: u64 = 100;

        loop {
            if *shutdown.lock().await {
                debug!(
                    node_id = node_id.get(),
                    peer_id = peer_id.get(),
                    "sender loop shutting down"
                );
                break;
            }

            let Some(message) = rx.recv().await else {
                break; // Link closed.
            };

            // Establish the connection and introduce ourselves.
            if stream.is_none() {
                match Self::connect_and_greet(node_id, peer_id, &addr).await {
                    Ok(s) => {
                        stream = Some(s);
                        reconnect_delay_ms = 100;
                        info!(
                            node_id = node_id.get(),
                            peer_id = peer_id.get(),
                            addr = %addr,
                            "connected to peer"
                        );
                    }
                    Err(e) => {
                        // The queued message is lost; the heartbeat cycle
                        // will carry its content again.
                        warn!(
                            node_id = node_id.get(),
                            peer_id = peer_id.get(),
                            error = %e,
                            "failed to connect, will retry"
                        );
                        tokio::time::sleep(tokio::time::Duration::from_millis(reconnect_delay_ms))
                            .await;
                        reconnect_delay_ms = (reconnect_delay_ms * 2).min(MAX_RECONNECT_DELAY_MS);
                        continue;
                    }
                }
            }

            if let Some(ref mut s) = stream {
                let result = match encode_frame(&Frame::Peer(message)) {
                    Ok(bytes) => Self::send_bytes(s, &bytes).await,
                    Err(e) => Err(e.into()),
                };

                if let Err(e) = result {
                    warn!(
                        peer_id = peer_id.get(),
                        error = %e,
                        "failed to send, reconnecting"
                    );
                    stream = None;
                }
            }
        }
    }

    /// Connects to a peer and sends the `Hello` frame.
    async fn connect_and_greet(
        node_id: NodeId,
        peer_id: NodeId,
        addr: &str,
    ) -> TransportResult<TcpStream> {
        let mut stream = Self::connect_to_peer(peer_id, addr).await?;
        let hello = encode_frame(&Frame::Hello { node_id })?;
        Self::send_bytes(&mut stream, &hello).await?;
        Ok(stream)
    }

    /// Connects to a peer with timeout, resolving hostnames at connect
    /// time.
    async fn connect_to_peer(peer_id: NodeId, addr: &str) -> TransportResult<TcpStream> {
        let timeout = tokio::time::Duration::from_millis(CONNECT_TIMEOUT_MS);

        let connect_future = async {
            let mut addrs = tokio::net::lookup_host(addr).await?;
            let resolved = addrs.next().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses found for {addr}"),
                )
            })?;
            TcpStream::connect(resolved).await
        };

        match tokio::time::timeout(timeout, connect_future).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::ConnectFailed {
                node_id: peer_id,
                addr: addr.to_string(),
                source: e,
            }),
            Err(_) => Err(TransportError::ConnectFailed {
                node_id: peer_id,
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
            }),
        }
    }

    async fn send_bytes(stream: &mut TcpStream, data: &[u8]) -> TransportResult<()> {
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Receives frames from one inbound connection.
    ///
    /// The first frame must be a `Hello` naming a configured peer; the
    /// connection is dropped otherwise.
    async fn receive_loop(
        mut stream: TcpStream,
        incoming_tx: mpsc::Sender<Message>,
        shutdown: Arc<Mutex<bool>>,
        allowed: HashSet<NodeId>,
    ) -> TransportResult<()> {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut authenticated: Option<NodeId> = None;

        loop {
            if *shutdown.lock().await {
                break;
            }

            let bytes_read = stream.read_buf(&mut buffer).await?;
            if bytes_read == 0 {
                debug!("connection closed by peer");
                break;
            }

            while !buffer.is_empty() {
                match decode_frame(&buffer) {
                    Ok((frame, consumed)) => {
                        let _ = buffer.split_to(consumed);

                        match frame {
                            Frame::Hello { node_id } => {
                                if !allowed.contains(&node_id) {
                                    warn!(
                                        claimed = node_id.get(),
                                        "rejecting connection from unknown peer"
                                    );
                                    return Ok(());
                                }
                                debug!(peer_id = node_id.get(), "peer authenticated");
                                authenticated = Some(node_id);
                            }
                            Frame::Peer(message) => {
                                let Some(peer_id) = authenticated else {
                                    warn!("dropping connection: message before hello");
                                    return Ok(());
                                };
                                if message.from() != peer_id {
                                    warn!(
                                        peer_id = peer_id.get(),
                                        claimed = message.from().get(),
                                        "dropping connection: sender mismatch"
                                    );
                                    return Ok(());
                                }
                                if incoming_tx.send(message).await.is_err() {
                                    // Receiver dropped.
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(CodecError::InsufficientData { .. }) => {
                        // Need more data.
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to decode frame");
                        return Err(e.into());
                    }
                }
            }

            // Keep the buffer from growing unbounded.
            if buffer.capacity() > READ_BUFFER_SIZE * 2 {
                buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
            }
        }

        Ok(())
    }
}

/// Creates a TCP listener with `SO_REUSEADDR`, so restarts can rebind a
/// port still in `TIME_WAIT`.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use gavel_core::{LogIndex, MsgSeq, TermId};
    use gavel_raft::RequestVoteRequest;

    use super::*;

    fn vote_from(from: u64) -> Message {
        Message::RequestVote(RequestVoteRequest {
            term: TermId::new(1),
            candidate_id: NodeId::new(from),
            seq: MsgSeq::new(0),
            last_log_index: LogIndex::NONE,
            last_log_term: TermId::new(0),
        })
    }

    #[tokio::test]
    async fn test_transport_starts_and_shuts_down() {
        let config = TransportConfig::new(NodeId::new(1), "127.0.0.1:0".parse().unwrap());
        let (transport, _incoming) = Transport::new(config);
        let handle = transport.start().await.unwrap();

        assert!(!handle.is_shutdown().await);
        handle.shutdown().await;
        assert!(handle.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let config = TransportConfig::new(NodeId::new(1), "127.0.0.1:0".parse().unwrap());
        let (transport, _incoming) = Transport::new(config);
        let handle = transport.start().await.unwrap();

        let result = handle.send(NodeId::new(99), vote_from(1)).await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_messages() {
        let node2_addr: SocketAddr = "127.0.0.1:19302".parse().unwrap();
        let node1_addr: SocketAddr = "127.0.0.1:19301".parse().unwrap();

        let (transport2, mut incoming2) = Transport::new(
            TransportConfig::new(NodeId::new(2), node2_addr).with_peer(NodeId::new(1), "127.0.0.1:19301"),
        );
        let _handle2 = transport2.start().await.unwrap();

        let (transport1, _incoming1) = Transport::new(
            TransportConfig::new(NodeId::new(1), node1_addr).with_peer(NodeId::new(2), "127.0.0.1:19302"),
        );
        let handle1 = transport1.start().await.unwrap();

        let message = vote_from(1);
        handle1.send(NodeId::new(2), message.clone()).await.unwrap();

        let received = tokio::time::timeout(tokio::time::Duration::from_secs(2), incoming2.recv())
            .await
            .expect("timeout waiting for message")
            .expect("channel closed");
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_unknown_peer_connection_rejected() {
        let node2_addr: SocketAddr = "127.0.0.1:19402".parse().unwrap();

        // Node 2 only knows node 1; node 9 is a stranger.
        let (transport2, mut incoming2) = Transport::new(
            TransportConfig::new(NodeId::new(2), node2_addr).with_peer(NodeId::new(1), "127.0.0.1:19401"),
        );
        let _handle2 = transport2.start().await.unwrap();

        let (transport9, _incoming9) = Transport::new(
            TransportConfig::new(NodeId::new(9), "127.0.0.1:19409".parse().unwrap())
                .with_peer(NodeId::new(2), "127.0.0.1:19402"),
        );
        let handle9 = transport9.start().await.unwrap();

        // The send is queued and the connection attempted; node 2 must
        // drop it at the handshake.
        let _ = handle9.send(NodeId::new(2), vote_from(9)).await;

        let received =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), incoming2.recv()).await;
        assert!(received.is_err(), "message from unknown peer must not arrive");
    }

    #[tokio::test]
    async fn test_sender_mismatch_rejected() {
        let node2_addr: SocketAddr = "127.0.0.1:19502".parse().unwrap();

        let (transport2, mut incoming2) = Transport::new(
            TransportConfig::new(NodeId::new(2), node2_addr).with_peer(NodeId::new(1), "127.0.0.1:19501"),
        );
        let _handle2 = transport2.start().await.unwrap();

        // A raw client that greets as node 1 but relays a message claiming
        // to be from node 3.
        let mut stream = TcpStream::connect(node2_addr).await.unwrap();
        let hello = encode_frame(&Frame::Hello {
            node_id: NodeId::new(1),
        })
        .unwrap();
        stream.write_all(&hello).await.unwrap();
        let forged = encode_frame(&Frame::Peer(vote_from(3))).unwrap();
        stream.write_all(&forged).await.unwrap();
        stream.flush().await.unwrap();

        let received =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), incoming2.recv()).await;
        assert!(received.is_err(), "forged sender must not arrive");
    }
}
