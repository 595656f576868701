//! Gavel Runtime - the async driver for a Gavel consensus node.
//!
//! Everything the pure state machine in `gavel-raft` delegates lives here:
//! the named cancellable timers, the wire codec and TCP transport between
//! peers, the back-end seam the applier feeds, and the node driver that
//! serializes timers, inbound RPCs and client submissions into one handler
//! loop.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod server;
pub mod timer;
pub mod transport;

pub use backend::{BackendError, CommandBackend, DisabledBackend};
pub use config::{NodeConfig, PeerConfig, TimingConfig};
pub use server::{start_node, NodeEvent, NodeHandle, NodeRuntime, NodeStatus, ServerError};
pub use transport::{Transport, TransportConfig, TransportError, TransportHandle};
