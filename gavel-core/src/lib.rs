//! Gavel Core - shared types for the Gavel consensus cluster.
//!
//! This crate holds the vocabulary the other crates speak: strongly-typed
//! identifiers, the replicated command set, the fatal-fault taxonomy and
//! system-wide limits. It performs no I/O and has no async surface.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod command;
mod error;
pub mod limits;
mod types;

pub use command::{Command, CommandKind};
pub use error::ConsensusFault;
pub use types::{LogIndex, MsgSeq, NodeId, TermId};
